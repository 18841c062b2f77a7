//! Classifies captured IPv4 datagrams
//!
//! Only TCP segments are accepted. The IP and TCP headers are copied verbatim,
//! the payload only when inspection is on and it fits within the configured bound

use std::{
	io::{self, Write},
	net::Ipv4Addr,
};

use byteorder::{BigEndian, WriteBytesExt};
use etherparse::{Ipv4HeaderSlice, ReadError, TcpHeaderSlice};

use super::{ClassifyError, RouterConfig, RoutingKey};

pub const IPPROTO_TCP: u8 = 6;

/// Largest payload copied into a description by default
pub const MAX_PAYLOAD_LEN: usize = 128;

/// Everything a connection handler needs to replay one captured segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketDescription {
	pub ip_header: Vec<u8>,
	pub tcp_header: Vec<u8>,
	pub destination: Ipv4Addr,
	pub dst_port: u16,
	pub payload: Option<Vec<u8>>,
}

impl PacketDescription {
	#[inline]
	pub fn key(&self) -> RoutingKey {
		RoutingKey::from_endpoint(self.destination, self.dst_port)
	}

	/// Size of the frame written by `encode`
	pub fn encoded_len(&self) -> usize {
		6 + self.ip_header.len()
			+ self.tcp_header.len()
			+ self.payload.as_ref().map_or(0, Vec::len)
	}

	/// Write the description as three length prefixed sections:
	/// IP header, TCP header and payload (empty when absent)
	pub fn encode<W: Write>(&self, out: &mut W) -> io::Result<()> {
		let payload: &[u8] = self.payload.as_deref().unwrap_or(&[]);
		for section in [&self.ip_header[..], &self.tcp_header[..], payload].iter() {
			out.write_u16::<BigEndian>(section.len() as u16)?;
			out.write_all(section)?;
		}
		Ok(())
	}
}

#[derive(Clone, Copy, Debug)]
pub struct Classifier {
	inspect_payload: bool,
	max_payload: usize,
}

impl Classifier {
	pub fn new(inspect_payload: bool, max_payload: usize) -> Self {
		Self {
			inspect_payload,
			max_payload,
		}
	}

	pub fn from_config(cfg: &RouterConfig) -> Self {
		Self::new(cfg.inspect_payload, cfg.max_payload)
	}

	pub fn classify(&self, datagram: &[u8]) -> Result<PacketDescription, ClassifyError> {
		// segmentation offload can leave the total length at 0, the header itself is fine
		let patched: Vec<u8>;
		let ip = match Ipv4HeaderSlice::from_slice(datagram) {
			Ok(ip) => ip,
			Err(ReadError::Ipv4TotalLengthTooSmall(total_len)) => {
				let ihl = usize::from(datagram[0] & 0x0f) * 4;
				log::debug!("ip total length {} below header length {}", total_len, ihl);
				let mut header = datagram[..ihl].to_vec();
				header[2..4].copy_from_slice(&(ihl as u16).to_be_bytes());
				patched = header;
				Ipv4HeaderSlice::from_slice(&patched).map_err(ClassifyError::Ip)?
			}
			Err(e) => return Err(ClassifyError::Ip(e)),
		};
		if ip.protocol() != IPPROTO_TCP {
			return Err(ClassifyError::NotTcp(ip.protocol()));
		}
		let size_ip = ip.slice().len();
		let tcp = TcpHeaderSlice::from_slice(&datagram[size_ip..]).map_err(ClassifyError::Tcp)?;

		let payload = if self.inspect_payload {
			let headers = size_ip + tcp.slice().len();
			let total_len = u16::from_be_bytes([datagram[2], datagram[3]]);
			self.payload(datagram, headers, usize::from(total_len))
		} else {
			None
		};

		Ok(PacketDescription {
			ip_header: datagram[..size_ip].to_vec(),
			tcp_header: tcp.slice().to_vec(),
			destination: ip.destination_addr(),
			dst_port: tcp.destination_port(),
			payload,
		})
	}

	fn payload(&self, datagram: &[u8], headers: usize, total_len: usize) -> Option<Vec<u8>> {
		let content_len = total_len.saturating_sub(headers);
		if content_len == 0 {
			return None;
		}
		if content_len > self.max_payload {
			log::debug!(
				"payload of {} bytes exceeds {}, not copied",
				content_len,
				self.max_payload
			);
			return None;
		}
		match datagram.get(headers..headers + content_len) {
			Some(bytes) => Some(bytes.to_vec()),
			None => {
				log::debug!(
					"datagram holds {} bytes, ip header claims {}",
					datagram.len(),
					total_len
				);
				None
			}
		}
	}
}

impl Default for Classifier {
	fn default() -> Self {
		Self::new(false, MAX_PAYLOAD_LEN)
	}
}
