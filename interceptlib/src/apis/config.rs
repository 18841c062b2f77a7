//! Router tunables

use serde::Deserialize;

use super::{ConfigError, MAX_PAYLOAD_LEN};

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
	/// Name of the route cache, only used in logs
	pub name: String,
	/// Number of cache slots
	pub slots: usize,
	/// Seconds a route survives without being refreshed
	pub timeout_secs: u64,
	/// Copy small payloads into the packet description
	pub inspect_payload: bool,
	/// Largest payload that is copied when inspecting
	pub max_payload: usize,
	/// Refresh a route every time a packet is forwarded over it
	pub refresh_on_lookup: bool,
	/// Warn once a slot chain grows past this length, 0 disables
	pub chain_warn_len: usize,
	/// Packets held per key while waiting for a route, 0 is unbounded
	pub max_buffered_per_key: usize,
	/// Seconds delayed packets wait for a route before they are dropped, 0 keeps them
	pub delay_timeout_secs: u64,
}

impl RouterConfig {
	/// 256k slots
	pub const DEFAULT_SLOTS: usize = 1024 * 256;
	pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
	pub const DEFAULT_CHAIN_WARN_LEN: usize = 64;
	pub const DEFAULT_MAX_BUFFERED: usize = 256;

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.slots == 0 {
			return Err(ConfigError::Invalid("slots must be non-zero".into()));
		}
		if self.inspect_payload && self.max_payload == 0 {
			return Err(ConfigError::Invalid(
				"max_payload must be non-zero when inspect_payload is set".into(),
			));
		}
		Ok(())
	}
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			name: String::from("client--src table"),
			slots: Self::DEFAULT_SLOTS,
			timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
			inspect_payload: false,
			max_payload: MAX_PAYLOAD_LEN,
			refresh_on_lookup: false,
			chain_warn_len: Self::DEFAULT_CHAIN_WARN_LEN,
			max_buffered_per_key: Self::DEFAULT_MAX_BUFFERED,
			delay_timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
		}
	}
}
