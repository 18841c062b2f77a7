//! Captures TCP datagrams off a raw layer 3 socket and hands them to the router thread
//!
//! Needs CAP_NET_RAW. The capture thread never waits on the router:
//! when the event channel is full the datagram is dropped.
//! Socket errors back off, and enough of them in a row stop the capture

use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::Duration,
};

use anyhow::{bail, Context, Result};
use crossbeam::channel::{Sender, TrySendError};
use pnet::{
	packet::{ip::IpNextHeaderProtocols, Packet},
	transport::{ipv4_packet_iter, transport_channel, TransportChannelType::Layer3},
};

use super::Event;

/// Consecutive receive errors before giving up
const MAX_FAILURES: u32 = 10;

/// Pause after the `failures`th consecutive receive error, `None` once it is time to stop
fn backoff(failures: u32) -> Option<Duration> {
	if failures >= MAX_FAILURES {
		return None;
	}
	Some(Duration::from_millis(10 << failures.min(6)))
}

pub(crate) fn capture(buf_size: usize, events: Sender<Event>, kr: Arc<AtomicBool>) -> Result<()> {
	let (_tx, mut rx) = transport_channel(buf_size, Layer3(IpNextHeaderProtocols::Tcp))
		.context("failed to open raw tcp socket")?;
	let mut iter = ipv4_packet_iter(&mut rx);
	let mut dropped = 0u64;
	let mut failures = 0;
	log::info!("capture started");
	while kr.load(Ordering::SeqCst) {
		let pkt = match iter.next() {
			Ok((pkt, _)) => {
				failures = 0;
				pkt
			}
			Err(e) => {
				failures += 1;
				log::error!("capture failed ({} in a row): {}", failures, e);
				match backoff(failures) {
					Some(pause) => thread::sleep(pause),
					None => bail!("capture gave up after {} errors: {}", failures, e),
				}
				continue;
			}
		};
		match events.try_send(Event::Packet(pkt.packet().to_vec())) {
			Ok(_) => {}
			Err(TrySendError::Full(_)) => {
				dropped += 1;
				if dropped.is_power_of_two() {
					log::warn!("router is behind, {} captured packets dropped", dropped);
				}
			}
			Err(TrySendError::Disconnected(_)) => break,
		}
	}
	log::info!("capture stopped, {} packets dropped", dropped);
	Ok(())
}
