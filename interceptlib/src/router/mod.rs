//! The Router ties the route cache, the delay table and the delivery channel together
//!
//! Per routing key a flow is in one of three states:
//! 	Unrouted  - nothing known about the key
//! 	Buffering - no route, packets parked in the delay buffer
//! 	Routed    - a route exists, packets are delivered as they arrive
//!
//! `add` is the only way from Buffering to Routed; it flushes whatever was parked.
//! `del` drops both the route and anything parked, back to Unrouted
//!
//! The router is driven by a single thread. Every call runs to completion
//! and nothing in here blocks or locks

mod delay;

pub use delay::*;

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::{
	CacheError, Classifier, ClassifyError, Clock, ConfigError, Descriptor, PacketDescription,
	RouteCache, RouterConfig, RoutingKey, SystemClock,
};

/// Hands a packet to whoever owns `descriptor`
///
/// Failures stay on the delivery side, the router never learns about them
pub trait Delivery {
	fn deliver(&mut self, descriptor: Descriptor, packet: &PacketDescription);
}

/// Records deliveries, handy for inspection
impl Delivery for Vec<(Descriptor, PacketDescription)> {
	fn deliver(&mut self, descriptor: Descriptor, packet: &PacketDescription) {
		self.push((descriptor, packet.clone()));
	}
}

#[derive(Error, Debug)]
pub enum RouterError {
	#[error("Route cache: {}", _0)]
	Cache(#[from] CacheError),
	#[error("Configuration: {}", _0)]
	Config(#[from] ConfigError),
	#[error("router has been destroyed")]
	Destroyed,
}

/// What `update` did with a datagram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
	/// Not a TCP segment, or unreadable
	Dropped,
	Forwarded(Descriptor),
	Buffered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
	pub forwarded: u64,
	pub buffered: u64,
	pub dropped: u64,
	/// Packets delivered out of the delay buffer
	pub flushed: u64,
	/// Packets thrown away by `del`
	pub discarded: u64,
	/// Routes expired
	pub evicted: u64,
	/// Delayed packets that waited too long for a route
	pub aged_out: u64,
}

pub struct Router<B: DelayBuffer, D: Delivery> {
	cache: Option<RouteCache>,
	buffer: B,
	delivery: D,
	classifier: Classifier,
	clock: Box<dyn Clock>,
	refresh_on_lookup: bool,
	stats: RouterStats,
}

impl<B: DelayBuffer, D: Delivery> Router<B, D> {
	pub fn new(cfg: &RouterConfig, buffer: B, delivery: D) -> Result<Self, RouterError> {
		Self::with_clock(cfg, buffer, delivery, Box::new(SystemClock))
	}

	pub fn with_clock(
		cfg: &RouterConfig,
		buffer: B,
		delivery: D,
		clock: Box<dyn Clock>,
	) -> Result<Self, RouterError> {
		cfg.validate()?;
		let mut cache = RouteCache::new(&cfg.name, cfg.slots, cfg.timeout_secs)?;
		cache.set_chain_warn_len(cfg.chain_warn_len);
		log::info!(
			"create table {}, size: {}, timeout: {}s",
			cache.name(),
			cache.slots(),
			cache.timeout()
		);
		Ok(Self {
			cache: Some(cache),
			buffer,
			delivery,
			classifier: Classifier::from_config(cfg),
			clock,
			refresh_on_lookup: cfg.refresh_on_lookup,
			stats: RouterStats::default(),
		})
	}

	/// Route one captured IP datagram
	///
	/// Expires stale routes in the key's slot first, then either delivers
	/// the packet over the route or parks it in the delay buffer
	pub fn update(&mut self, datagram: &[u8]) -> Result<Disposition, RouterError> {
		let cache = self.cache.as_mut().ok_or(RouterError::Destroyed)?;
		let packet = match self.classifier.classify(datagram) {
			Ok(packet) => packet,
			Err(ClassifyError::NotTcp(protocol)) => {
				log::info!("this is not a tcp packet (protocol {})", protocol);
				self.stats.dropped += 1;
				return Ok(Disposition::Dropped);
			}
			Err(e) => {
				log::info!("dropping packet: {}", e);
				self.stats.dropped += 1;
				return Ok(Disposition::Dropped);
			}
		};

		let key = packet.key();
		let now = self.clock.now();
		self.stats.evicted += cache.evict_stale(key, now) as u64;

		match cache.find(key) {
			Some(descriptor) => {
				if self.refresh_on_lookup {
					cache.touch(key, now);
				}
				self.delivery.deliver(descriptor, &packet);
				self.stats.forwarded += 1;
				Ok(Disposition::Forwarded(descriptor))
			}
			None => {
				log::info!("no destination for {}, delaying packet", key);
				self.buffer.enqueue(key, packet, now);
				self.stats.buffered += 1;
				Ok(Disposition::Buffered)
			}
		}
	}

	/// Route `address:port` to `descriptor` and flush anything waiting for it
	///
	/// Returns the number of delayed packets delivered
	pub fn add(
		&mut self,
		address: Ipv4Addr,
		port: u16,
		descriptor: Descriptor,
	) -> Result<usize, RouterError> {
		let cache = self.cache.as_mut().ok_or(RouterError::Destroyed)?;
		let key = RoutingKey::from_endpoint(address, port);
		let now = self.clock.now();
		cache.insert(key, descriptor, now);
		let flushed = self.buffer.flush(key, descriptor, now, &mut self.delivery);
		self.stats.flushed += flushed as u64;
		log::debug!("route {} -> {}, {} delayed packets sent", key, descriptor, flushed);
		Ok(flushed)
	}

	/// Forget the route for `address:port` along with any delayed packets
	///
	/// Returns the descriptor the key was routed to, if any
	pub fn del(&mut self, address: Ipv4Addr, port: u16) -> Result<Option<Descriptor>, RouterError> {
		let cache = self.cache.as_mut().ok_or(RouterError::Destroyed)?;
		let key = RoutingKey::from_endpoint(address, port);
		let removed = cache.delete(key);
		self.stats.discarded += self.buffer.clear(key) as u64;
		log::debug!("route {} removed", key);
		Ok(removed)
	}

	/// Expire stale routes in every slot, and delayed packets that waited too long
	///
	/// Returns the number of routes expired
	pub fn sweep(&mut self) -> Result<usize, RouterError> {
		let cache = self.cache.as_mut().ok_or(RouterError::Destroyed)?;
		let evicted = cache.sweep(self.clock.now());
		self.stats.evicted += evicted as u64;
		if evicted > 0 {
			log::info!("{}: swept {} stale routes", cache.name(), evicted);
		}
		self.expire_delayed()?;
		Ok(evicted)
	}

	/// Drop delayed packets that waited too long for a route
	pub fn expire_delayed(&mut self) -> Result<usize, RouterError> {
		if self.cache.is_none() {
			return Err(RouterError::Destroyed);
		}
		let dropped = self.buffer.expire(self.clock.now());
		self.stats.aged_out += dropped as u64;
		if dropped > 0 {
			log::info!("dropped {} delayed packets nobody routed", dropped);
		}
		Ok(dropped)
	}

	/// Tear down the route cache; safe to call more than once
	pub fn destroy(&mut self) {
		if let Some(mut cache) = self.cache.take() {
			log::info!("destroy router table {}", cache.name());
			cache.clear();
		}
	}

	#[inline]
	pub fn is_destroyed(&self) -> bool {
		self.cache.is_none()
	}

	pub fn cache(&self) -> Option<&RouteCache> {
		self.cache.as_ref()
	}

	pub fn buffer(&self) -> &B {
		&self.buffer
	}

	pub fn delivery(&self) -> &D {
		&self.delivery
	}

	pub fn delivery_mut(&mut self) -> &mut D {
		&mut self.delivery
	}

	pub fn stats(&self) -> RouterStats {
		self.stats
	}
}

impl<B: DelayBuffer, D: Delivery> Drop for Router<B, D> {
	fn drop(&mut self) {
		self.destroy();
	}
}
