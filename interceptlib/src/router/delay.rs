//! The delay table holds packets whose destination has no route yet
//!
//! Packets are queued per routing key and either flushed to a descriptor
//! once a route for the key is added, or discarded when the route is deleted.
//! A queue nobody has written to for `max_age` seconds is stale: it is thrown
//! away instead of flushed, and `expire` reclaims it

use std::collections::{HashMap, VecDeque};

use crate::{Descriptor, PacketDescription, RouterConfig, RoutingKey};

use super::Delivery;

pub trait DelayBuffer {
	fn enqueue(&mut self, key: RoutingKey, packet: PacketDescription, now: u64);

	/// Deliver everything queued under `key` to `descriptor` and forget it
	fn flush(
		&mut self,
		key: RoutingKey,
		descriptor: Descriptor,
		now: u64,
		sink: &mut dyn Delivery,
	) -> usize;

	/// Discard everything queued under `key`
	fn clear(&mut self, key: RoutingKey) -> usize;

	/// Discard every stale queue, returns the number of packets dropped
	fn expire(&mut self, now: u64) -> usize;
}

#[derive(Debug, Default)]
struct Pending {
	packets: VecDeque<PacketDescription>,
	/// Seconds
	last_write: u64,
}

#[derive(Debug, Default)]
pub struct DelayTable {
	pending: HashMap<RoutingKey, Pending>,
	max_per_key: usize,
	max_age: u64,
}

impl DelayTable {
	/// `max_per_key` of 0 means unbounded, `max_age` of 0 means packets never go stale
	pub fn new(max_per_key: usize, max_age: u64) -> Self {
		Self {
			pending: HashMap::new(),
			max_per_key,
			max_age,
		}
	}

	pub fn from_config(cfg: &RouterConfig) -> Self {
		Self::new(cfg.max_buffered_per_key, cfg.delay_timeout_secs)
	}

	pub fn max_per_key(&self) -> usize {
		self.max_per_key
	}

	pub fn max_age(&self) -> u64 {
		self.max_age
	}

	#[inline]
	fn is_stale(&self, queue: &Pending, now: u64) -> bool {
		self.max_age > 0 && queue.last_write.saturating_add(self.max_age) < now
	}

	/// Packets waiting for `key`
	pub fn pending(&self, key: RoutingKey) -> usize {
		self.pending.get(&key).map_or(0, |q| q.packets.len())
	}

	/// Total packets held
	pub fn len(&self) -> usize {
		self.pending.values().map(|q| q.packets.len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Number of keys with packets waiting
	pub fn keys(&self) -> usize {
		self.pending.len()
	}
}

impl DelayBuffer for DelayTable {
	fn enqueue(&mut self, key: RoutingKey, packet: PacketDescription, now: u64) {
		let stale = self
			.pending
			.get(&key)
			.map_or(false, |queue| self.is_stale(queue, now));
		let queue = self.pending.entry(key).or_default();
		if stale {
			log::debug!("dropped {} stale delayed packets for {}", queue.packets.len(), key);
			queue.packets.clear();
		}
		if self.max_per_key > 0 && queue.packets.len() >= self.max_per_key {
			queue.packets.pop_front();
			log::warn!("delay queue for {} is full, dropped oldest packet", key);
		}
		queue.packets.push_back(packet);
		queue.last_write = now;
	}

	fn flush(
		&mut self,
		key: RoutingKey,
		descriptor: Descriptor,
		now: u64,
		sink: &mut dyn Delivery,
	) -> usize {
		let queue = match self.pending.remove(&key) {
			Some(queue) => queue,
			None => return 0,
		};
		if self.is_stale(&queue, now) {
			log::debug!("dropped {} stale delayed packets for {}", queue.packets.len(), key);
			return 0;
		}
		let len = queue.packets.len();
		for packet in queue.packets.iter() {
			sink.deliver(descriptor, packet);
		}
		log::debug!("flushed {} delayed packets for {} to {}", len, key, descriptor);
		len
	}

	fn clear(&mut self, key: RoutingKey) -> usize {
		self.pending.remove(&key).map_or(0, |queue| queue.packets.len())
	}

	fn expire(&mut self, now: u64) -> usize {
		if self.max_age == 0 {
			return 0;
		}
		let max_age = self.max_age;
		let mut dropped = 0;
		self.pending.retain(|_, queue| {
			let fresh = queue.last_write.saturating_add(max_age) >= now;
			if !fresh {
				dropped += queue.packets.len();
			}
			fresh
		});
		if dropped > 0 {
			log::debug!("dropped {} stale delayed packets", dropped);
		}
		dropped
	}
}
