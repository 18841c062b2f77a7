//! Connection handlers and how packets reach them
//!
//! A handler connects to the mux over a unix socket and is given a descriptor that is never
//! handed out again, unlike the socket's fd which the kernel reuses once it is closed.
//! The connection is split in two:
//! 	a reader turning control frames (add/del a route) into events
//! 	a writer pushing forwarded packet frames back to the handler
//!
//! Control frame, 8 bytes, big endian:
//! 	op (1 = add, 2 = del) | reserved | port (2) | IPv4 address (4)

use std::{
	collections::HashMap,
	fs,
	io::{self, Read, Write},
	net::Ipv4Addr,
	os::{
		raw::c_int,
		unix::{
			io::AsRawFd,
			net::{UnixListener, UnixStream},
		},
	},
	path::Path,
	thread::spawn,
};

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use interceptlib::{Delivery, Descriptor, PacketDescription};

use super::Event;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
	Add(Ipv4Addr, u16),
	Del(Ipv4Addr, u16),
}

impl Control {
	const OP_ADD: u8 = 1;
	const OP_DEL: u8 = 2;

	/// `None` on a clean end of stream
	pub(crate) fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
		let op = match r.read_u8() {
			Ok(op) => op,
			Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
			Err(e) => return Err(e),
		};
		let _reserved = r.read_u8()?;
		let port = r.read_u16::<BigEndian>()?;
		let address = Ipv4Addr::from(r.read_u32::<BigEndian>()?);
		match op {
			Self::OP_ADD => Ok(Some(Control::Add(address, port))),
			Self::OP_DEL => Ok(Some(Control::Del(address, port))),
			other => Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("unknown control op {}", other),
			)),
		}
	}

	#[cfg(test)]
	pub(crate) fn to_bytes(self) -> [u8; 8] {
		let (op, address, port) = match self {
			Control::Add(a, p) => (Self::OP_ADD, a, p),
			Control::Del(a, p) => (Self::OP_DEL, a, p),
		};
		let mut buf = [0u8; 8];
		buf[0] = op;
		buf[2..4].copy_from_slice(&port.to_be_bytes());
		buf[4..].copy_from_slice(&address.octets());
		buf
	}
}

/// Hands out handler descriptors in increasing order
#[derive(Debug, Default)]
pub(crate) struct DescriptorSeq(c_int);

impl DescriptorSeq {
	pub(crate) fn next(&mut self) -> Descriptor {
		let descriptor = Descriptor::new(self.0);
		self.0 = self.0.wrapping_add(1).max(0);
		descriptor
	}
}

/// Writer side of every registered handler, keyed by descriptor
#[derive(Default)]
pub(crate) struct Clients {
	senders: HashMap<Descriptor, Sender<Vec<u8>>>,
	dropped: u64,
}

impl Clients {
	pub(crate) fn register(&mut self, descriptor: Descriptor, sender: Sender<Vec<u8>>) {
		self.senders.insert(descriptor, sender);
	}

	/// Dropping the sender ends the handler's writer thread
	pub(crate) fn unregister(&mut self, descriptor: Descriptor) -> bool {
		self.senders.remove(&descriptor).is_some()
	}

	pub(crate) fn len(&self) -> usize {
		self.senders.len()
	}

	/// Frames thrown away because a handler fell behind
	pub(crate) fn dropped(&self) -> u64 {
		self.dropped
	}
}

impl Delivery for Clients {
	fn deliver(&mut self, descriptor: Descriptor, packet: &PacketDescription) {
		let sender = match self.senders.get(&descriptor) {
			Some(sender) => sender,
			None => {
				log::error!("no client behind {}, dropping packet", descriptor);
				self.dropped += 1;
				return;
			}
		};
		let mut frame = Vec::with_capacity(packet.encoded_len());
		if let Err(e) = packet.encode(&mut frame) {
			log::error!("Error encoding packet: {}", e);
			return;
		}
		match sender.try_send(frame) {
			Ok(_) => {}
			Err(TrySendError::Full(_)) => {
				self.dropped += 1;
				log::warn!("client {} is not keeping up, dropping packet", descriptor);
			}
			Err(TrySendError::Disconnected(_)) => {
				log::info!("client {} has gone away", descriptor);
				self.senders.remove(&descriptor);
			}
		}
	}
}

/// Push frames to the handler until the mux drops our channel
fn handle_client(mut stream: UnixStream, frames: Receiver<Vec<u8>>) {
	for frame in frames.iter() {
		if let Err(e) = stream.write_all(&frame) {
			log::error!("Error sending packet: {}", e);
			#[cfg(feature = "debug")]
			println!("Error sending packet: {}", e);
			return;
		}
	}
	log::info!("channel has been closed");
}

/// Turn control frames from the handler into events
fn read_control(mut stream: UnixStream, descriptor: Descriptor, events: Sender<Event>) {
	loop {
		let event = match Control::read_from(&mut stream) {
			Ok(Some(Control::Add(address, port))) => Event::Add(descriptor, address, port),
			Ok(Some(Control::Del(address, port))) => Event::Del(descriptor, address, port),
			Ok(None) => break,
			Err(e) => {
				log::error!("bad control frame from {}: {}", descriptor, e);
				break;
			}
		};
		if events.send(event).is_err() {
			return;
		}
	}
	events.send(Event::Disconnect(descriptor)).ok();
}

/// Accept connection handlers on `path`
///
/// Runs until the listener fails or the router goes away
pub(crate) fn listen(path: &Path, capacity: usize, events: Sender<Event>) -> Result<()> {
	fs::remove_file(path).ok();
	let listener = UnixListener::bind(path)
		.with_context(|| format!("failed to bind {}", path.display()))?;
	log::info!("listening for clients on {}", path.display());
	let mut seq = DescriptorSeq::default();
	for stream in listener.incoming() {
		let stream = match stream {
			Ok(stream) => stream,
			Err(e) => {
				log::error!("failed to connect: {}", e);
				continue;
			}
		};
		let reader = match stream.try_clone() {
			Ok(reader) => reader,
			Err(e) => {
				log::error!("failed to split client stream: {}", e);
				continue;
			}
		};
		let descriptor = seq.next();
		log::debug!(
			"client on socket fd {} gets descriptor {}",
			stream.as_raw_fd(),
			descriptor.as_raw()
		);
		let (send, recv) = bounded(capacity);
		if events.send(Event::Connect(descriptor, send)).is_err() {
			break;
		}
		spawn(move || handle_client(stream, recv));
		let events = events.clone();
		spawn(move || read_control(reader, descriptor, events));
	}
	Ok(())
}
