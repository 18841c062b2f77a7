//! Routing keys and descriptors
//!
//! A routing key packs a destination IPv4 address and port into one integer:
//! the address occupies bits 16..48 and the port bits 0..16

use std::{fmt, net::Ipv4Addr, os::raw};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(u64);

impl RoutingKey {
	const FNV_OFFSET: u64 = 0xcbf29ce484222325;
	const FNV_PRIME: u64 = 0x100000001b3;

	#[inline]
	pub const fn new(address: u32, port: u16) -> Self {
		Self(((address as u64) << 16) | port as u64)
	}

	#[inline]
	pub fn from_endpoint(address: Ipv4Addr, port: u16) -> Self {
		Self::new(u32::from(address), port)
	}

	/// Returns the packed value
	#[inline]
	pub const fn raw(&self) -> u64 {
		self.0
	}

	#[inline]
	pub fn address(&self) -> Ipv4Addr {
		Ipv4Addr::from((self.0 >> 16) as u32)
	}

	#[inline]
	pub const fn port(&self) -> u16 {
		(self.0 & 0xffff) as u16
	}

	/// FNV-1a over the little endian bytes of the packed value
	///
	/// Only used to spread keys over cache slots
	#[inline]
	pub fn fnv1a(&self) -> u64 {
		let mut h = Self::FNV_OFFSET;
		for byte in self.0.to_le_bytes().iter() {
			h ^= *byte as u64;
			h = h.wrapping_mul(Self::FNV_PRIME);
		}
		h
	}
}

impl fmt::Display for RoutingKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.address(), self.port())
	}
}

/// Handle of the connection that replays a routed flow
///
/// The router never looks behind it; only the delivery channel resolves it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor(raw::c_int);

impl Descriptor {
	#[inline]
	pub const fn new(fd: raw::c_int) -> Self {
		Self(fd)
	}

	#[inline]
	pub const fn as_raw(&self) -> raw::c_int {
		self.0
	}
}

impl From<raw::c_int> for Descriptor {
	fn from(fd: raw::c_int) -> Self {
		Self(fd)
	}
}

impl fmt::Display for Descriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "fd {}", self.0)
	}
}
