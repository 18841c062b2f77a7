//! The RouteCache maps routing keys to the descriptor of the handler that owns them
//!
//! The cache has a fixed number of slots. Every slot holds a chain of entries
//! ordered by recency: the most recently inserted or touched entry sits at the head,
//! the least recently touched one at the tail
//!
//! Expiry is lazy and slot scoped. `evict_stale` only walks the chain a key hashes to,
//! popping stale entries off its tail. Slots that are never probed keep their stale
//! entries until they are, or until an explicit `sweep`

use std::collections::VecDeque;

use super::{CacheError, Descriptor, RoutingKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
	pub key: RoutingKey,
	pub descriptor: Descriptor,
	/// Seconds
	pub last_access: u64,
}

impl RouteEntry {
	#[inline]
	fn is_stale(&self, timeout: u64, now: u64) -> bool {
		self.last_access.saturating_add(timeout) < now
	}
}

pub struct RouteCache {
	name: String,
	slots: Vec<VecDeque<RouteEntry>>,
	timeout: u64,
	count: usize,
	chain_warn_len: usize,
	overlong: u64,
}

impl RouteCache {
	/// Allocate `slots` empty chains
	///
	/// Entries expire `timeout` seconds after they were last touched
	pub fn new(name: &str, slots: usize, timeout: u64) -> Result<Self, CacheError> {
		if slots == 0 {
			return Err(CacheError::ZeroSlots);
		}
		let mut chains = Vec::new();
		chains
			.try_reserve_exact(slots)
			.map_err(|_| CacheError::Alloc(slots))?;
		chains.resize_with(slots, VecDeque::new);
		Ok(Self {
			name: name.to_owned(),
			slots: chains,
			timeout,
			count: 0,
			chain_warn_len: 0,
			overlong: 0,
		})
	}

	/// Warn when a chain grows longer than `len`, 0 turns it off
	pub fn set_chain_warn_len(&mut self, len: usize) {
		self.chain_warn_len = len;
	}

	#[inline]
	fn slot(&self, key: RoutingKey) -> usize {
		(key.fnv1a() % self.slots.len() as u64) as usize
	}

	/// Map `key` to `descriptor` and move it to the head of its chain
	pub fn insert(&mut self, key: RoutingKey, descriptor: Descriptor, now: u64) {
		let idx = self.slot(key);
		let chain = &mut self.slots[idx];
		let existing = chain
			.iter()
			.position(|e| e.key == key)
			.and_then(|pos| chain.remove(pos));
		let entry = match existing {
			Some(mut entry) => {
				entry.descriptor = descriptor;
				entry.last_access = now;
				entry
			}
			None => {
				self.count += 1;
				RouteEntry {
					key,
					descriptor,
					last_access: now,
				}
			}
		};
		chain.push_front(entry);

		if self.chain_warn_len > 0 && chain.len() > self.chain_warn_len {
			self.overlong += 1;
			log::warn!(
				"{}: slot {} holds {} routes (limit {})",
				self.name,
				idx,
				chain.len(),
				self.chain_warn_len
			);
		}
	}

	/// Look a key up without touching it
	#[inline]
	pub fn find(&self, key: RoutingKey) -> Option<Descriptor> {
		self.slots[self.slot(key)]
			.iter()
			.find(|e| e.key == key)
			.map(|e| e.descriptor)
	}

	/// Refresh the timestamp of `key` and move it to the head of its chain
	pub fn touch(&mut self, key: RoutingKey, now: u64) -> bool {
		let idx = self.slot(key);
		let chain = &mut self.slots[idx];
		let existing = chain
			.iter()
			.position(|e| e.key == key)
			.and_then(|pos| chain.remove(pos));
		match existing {
			Some(mut entry) => {
				entry.last_access = now;
				chain.push_front(entry);
				true
			}
			None => false,
		}
	}

	pub fn delete(&mut self, key: RoutingKey) -> Option<Descriptor> {
		let idx = self.slot(key);
		let chain = &mut self.slots[idx];
		let entry = chain
			.iter()
			.position(|e| e.key == key)
			.and_then(|pos| chain.remove(pos))?;
		self.count -= 1;
		Some(entry.descriptor)
	}

	fn evict_chain(chain: &mut VecDeque<RouteEntry>, timeout: u64, now: u64) -> usize {
		let mut evicted = 0;
		while chain.back().map_or(false, |e| e.is_stale(timeout, now)) {
			if let Some(entry) = chain.pop_back() {
				log::debug!("route {} -> {} expired", entry.key, entry.descriptor);
				evicted += 1;
			}
		}
		evicted
	}

	/// Drop stale entries off the tail of the chain `key` hashes to
	///
	/// Stops at the first fresh entry. Other slots are left alone
	pub fn evict_stale(&mut self, key: RoutingKey, now: u64) -> usize {
		let idx = self.slot(key);
		let evicted = Self::evict_chain(&mut self.slots[idx], self.timeout, now);
		self.count -= evicted;
		evicted
	}

	/// Run `evict_stale` over every slot
	pub fn sweep(&mut self, now: u64) -> usize {
		let timeout = self.timeout;
		let evicted: usize = self
			.slots
			.iter_mut()
			.map(|chain| Self::evict_chain(chain, timeout, now))
			.sum();
		self.count -= evicted;
		evicted
	}

	/// Release every entry, keeping the slots
	pub fn clear(&mut self) {
		self.slots.iter_mut().for_each(VecDeque::clear);
		self.count = 0;
	}

	/// Inserts that left a chain longer than the warning limit
	pub fn overlong_chains(&self) -> u64 {
		self.overlong
	}

	/// Length of the chain `key` hashes to
	pub fn chain_len(&self, key: RoutingKey) -> usize {
		self.slots[self.slot(key)].len()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.count
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.count == 0
	}

	#[inline]
	pub fn slots(&self) -> usize {
		self.slots.len()
	}

	#[inline]
	pub fn timeout(&self) -> u64 {
		self.timeout
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const TIMEOUT: u64 = 60;

	fn key(n: u32) -> RoutingKey {
		RoutingKey::new(0x0A00_0000 + n, 8080)
	}

	#[test]
	fn test_zero_slots() {
		assert!(matches!(
			RouteCache::new("t", 0, TIMEOUT),
			Err(CacheError::ZeroSlots)
		));
	}

	#[test]
	fn test_insert_find_delete() {
		let mut cache = RouteCache::new("t", 1024, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(7), 0);
		assert_eq!(cache.find(key(1)), Some(Descriptor::new(7)));
		assert_eq!(cache.find(key(2)), None);
		assert_eq!(cache.len(), 1);

		assert_eq!(cache.delete(key(1)), Some(Descriptor::new(7)));
		assert_eq!(cache.find(key(1)), None);
		assert!(cache.is_empty());
	}

	#[test]
	fn test_delete_missing_is_noop() {
		let mut cache = RouteCache::new("t", 16, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(3), 0);
		assert_eq!(cache.delete(key(2)), None);
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn test_insert_overwrites_in_place() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(3), 0);
		cache.insert(key(1), Descriptor::new(4), 10);
		assert_eq!(cache.len(), 1);
		assert_eq!(cache.chain_len(key(1)), 1);
		assert_eq!(cache.find(key(1)), Some(Descriptor::new(4)));
	}

	#[test]
	fn test_single_slot_chains_everything() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		for n in 0..10 {
			cache.insert(key(n), Descriptor::new(n as i32), 0);
		}
		assert_eq!(cache.chain_len(key(0)), 10);
		for n in 0..10 {
			assert_eq!(cache.find(key(n)), Some(Descriptor::new(n as i32)));
		}
	}

	#[test]
	fn test_evict_stops_at_first_fresh_tail() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(1), 0);
		cache.insert(key(2), Descriptor::new(2), 10);
		cache.insert(key(3), Descriptor::new(3), 100);

		// key(1) is stale at 61, key(2) at 71
		assert_eq!(cache.evict_stale(key(3), 70), 1);
		assert_eq!(cache.find(key(1)), None);
		assert_eq!(cache.find(key(2)), Some(Descriptor::new(2)));
		assert_eq!(cache.len(), 2);
	}

	#[test]
	fn test_entry_at_exact_timeout_is_fresh() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(1), 0);
		assert_eq!(cache.evict_stale(key(1), TIMEOUT), 0);
		assert_eq!(cache.evict_stale(key(1), TIMEOUT + 1), 1);
		assert!(cache.is_empty());
	}

	#[test]
	fn test_reinsert_moves_entry_off_the_tail() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(1), 0);
		cache.insert(key(2), Descriptor::new(2), 0);
		cache.insert(key(1), Descriptor::new(1), 50);

		assert_eq!(cache.evict_stale(key(1), 100), 1);
		assert_eq!(cache.find(key(2)), None);
		assert_eq!(cache.find(key(1)), Some(Descriptor::new(1)));
	}

	#[test]
	fn test_find_does_not_postpone_expiry() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(1), 0);
		for t in (0..=TIMEOUT).step_by(10) {
			assert_eq!(cache.evict_stale(key(1), t), 0);
			assert!(cache.find(key(1)).is_some());
		}
		assert_eq!(cache.evict_stale(key(1), TIMEOUT + 1), 1);
		assert_eq!(cache.find(key(1)), None);
	}

	#[test]
	fn test_touch_postpones_expiry() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		cache.insert(key(1), Descriptor::new(1), 0);
		assert!(cache.touch(key(1), 50));
		assert!(!cache.touch(key(2), 50));
		assert_eq!(cache.evict_stale(key(1), TIMEOUT + 1), 0);
		assert_eq!(cache.find(key(1)), Some(Descriptor::new(1)));
	}

	#[test]
	fn test_evict_is_slot_scoped() {
		let mut cache = RouteCache::new("t", 4096, TIMEOUT).unwrap();
		let a = key(1);
		let b = (2..)
			.map(key)
			.find(|k| cache.slot(*k) != cache.slot(a))
			.unwrap();
		cache.insert(a, Descriptor::new(1), 0);
		cache.insert(b, Descriptor::new(2), 0);

		assert_eq!(cache.evict_stale(a, 1000), 1);
		assert_eq!(cache.find(a), None);
		assert_eq!(cache.find(b), Some(Descriptor::new(2)));

		assert_eq!(cache.sweep(1000), 1);
		assert!(cache.is_empty());
	}

	#[test]
	fn test_chain_warn_len() {
		let mut cache = RouteCache::new("t", 1, TIMEOUT).unwrap();
		for n in 0..3 {
			cache.insert(key(n), Descriptor::new(1), 0);
		}
		assert_eq!(cache.overlong_chains(), 0);

		cache.set_chain_warn_len(3);
		cache.insert(key(0), Descriptor::new(2), 0);
		assert_eq!(cache.overlong_chains(), 0);
		cache.insert(key(3), Descriptor::new(1), 0);
		cache.insert(key(4), Descriptor::new(1), 0);
		assert_eq!(cache.overlong_chains(), 2);
	}

	#[test]
	fn test_clear() {
		let mut cache = RouteCache::new("t", 8, TIMEOUT).unwrap();
		for n in 0..32 {
			cache.insert(key(n), Descriptor::new(1), 0);
		}
		cache.clear();
		assert!(cache.is_empty());
		assert_eq!(cache.slots(), 8);
		assert_eq!(cache.find(key(3)), None);
	}
}
