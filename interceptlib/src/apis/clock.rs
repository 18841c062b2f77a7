//! Wall clock used for route expiry, in whole seconds

#[cfg(test)]
use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock {
	/// Current time in seconds
	fn now(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	#[inline]
	fn now(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0)
	}
}

/// A clock that only moves when told to, for tests
///
/// Clones share the same time
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

#[cfg(test)]
impl ManualClock {
	pub fn new(start: u64) -> Self {
		Self(Arc::new(AtomicU64::new(start)))
	}

	pub fn set(&self, secs: u64) {
		self.0.store(secs, Ordering::SeqCst);
	}

	pub fn advance(&self, secs: u64) {
		self.0.fetch_add(secs, Ordering::SeqCst);
	}
}

#[cfg(test)]
impl Clock for ManualClock {
	#[inline]
	fn now(&self) -> u64 {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_manual_clock_is_shared() {
		let clock = ManualClock::new(100);
		let other = clock.clone();
		other.advance(5);
		assert_eq!(clock.now(), 105);
		clock.set(7);
		assert_eq!(other.now(), 7);
	}

	#[test]
	fn test_system_clock_is_past_epoch() {
		assert!(SystemClock.now() > 0);
	}
}
