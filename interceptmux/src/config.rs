//! Mux configuration, read from a TOML file
//!
//! Every field has a default so an empty file, or none at all, is a valid configuration.
//! Router tunables live under `[router]`

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use interceptlib::RouterConfig;
use serde::Deserialize;

const SOCK_NAME: &str = "/tmp/intercept-mux.socket";
const EVENT_CAP: usize = 4096;
const CLIENT_CAP: usize = 512;
const CAPTURE_BUF: usize = 65536;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct MuxConfig {
	/// Where connection handlers register
	pub(crate) socket_path: PathBuf,
	/// Events queued for the router thread
	pub(crate) event_capacity: usize,
	/// Frames queued per connection handler
	pub(crate) client_capacity: usize,
	/// Receive buffer of the raw capture socket
	pub(crate) capture_buffer: usize,
	/// Seconds between full route sweeps, 0 leaves expiry to packet arrival
	pub(crate) sweep_interval_secs: u64,
	pub(crate) router: RouterConfig,
}

impl MuxConfig {
	pub(crate) fn load(path: Option<&Path>) -> Result<Self> {
		let cfg = match path {
			Some(path) => {
				let text = fs::read_to_string(path)
					.with_context(|| format!("failed to read {}", path.display()))?;
				Self::from_toml(&text)
					.with_context(|| format!("invalid configuration in {}", path.display()))?
			}
			None => Self::default(),
		};
		log::info!("configuration: {:?}", cfg);
		Ok(cfg)
	}

	pub(crate) fn from_toml(text: &str) -> Result<Self> {
		let cfg: Self = toml::from_str(text)?;
		cfg.router.validate()?;
		if cfg.event_capacity == 0 || cfg.client_capacity == 0 {
			bail!("channel capacities must be non-zero");
		}
		Ok(cfg)
	}

	pub(crate) fn sweep_interval(&self) -> Option<Duration> {
		match self.sweep_interval_secs {
			0 => None,
			secs => Some(Duration::from_secs(secs)),
		}
	}
}

impl Default for MuxConfig {
	fn default() -> Self {
		Self {
			socket_path: PathBuf::from(SOCK_NAME),
			event_capacity: EVENT_CAP,
			client_capacity: CLIENT_CAP,
			capture_buffer: CAPTURE_BUF,
			sweep_interval_secs: 0,
			router: RouterConfig::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_empty_file_uses_defaults() {
		let cfg = MuxConfig::from_toml("").unwrap();
		assert_eq!(cfg.socket_path, PathBuf::from(SOCK_NAME));
		assert_eq!(cfg.router, RouterConfig::default());
		assert_eq!(cfg.sweep_interval(), None);
	}

	#[test]
	fn test_router_section() {
		let cfg = MuxConfig::from_toml(
			r#"
			socket_path = "/run/mux.sock"
			sweep_interval_secs = 30

			[router]
			timeout_secs = 10
			inspect_payload = true
			max_payload = 256
			"#,
		)
		.unwrap();
		assert_eq!(cfg.socket_path, PathBuf::from("/run/mux.sock"));
		assert_eq!(cfg.sweep_interval(), Some(Duration::from_secs(30)));
		assert_eq!(cfg.router.timeout_secs, 10);
		assert!(cfg.router.inspect_payload);
		assert_eq!(cfg.router.max_payload, 256);
		assert_eq!(cfg.router.slots, RouterConfig::DEFAULT_SLOTS);
	}

	#[test]
	fn test_invalid_router_section() {
		assert!(MuxConfig::from_toml("[router]\nslots = 0\n").is_err());
		assert!(MuxConfig::from_toml("client_capacity = 0\n").is_err());
	}
}
