//! This module defines the structures the router is built from
//!
//! Errors related to cache allocation, packet classification and configuration

mod cache;
mod clock;
mod config;
mod key;
mod packet;

pub use cache::*;
pub use clock::*;
pub use config::*;
pub use key::*;
pub use packet::*;

#[cfg(test)]
pub(crate) use packet::testpkt;

use etherparse::ReadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
	#[error("a route cache needs at least one slot")]
	ZeroSlots,
	#[error("could not allocate {} route cache slots", _0)]
	Alloc(usize),
}

#[derive(Error, Debug)]
pub enum ClassifyError {
	/// The datagram does not start with a readable IPv4 header
	#[error("Invalid IP header: {:?}", _0)]
	Ip(ReadError),
	#[error("Not a TCP packet, protocol {}", _0)]
	NotTcp(u8),
	#[error("Invalid TCP header: {:?}", _0)]
	Tcp(ReadError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("Invalid configuration: {}", _0)]
	Invalid(String),
}
