//! This module defines the Mux that owns the router
//!
//! The router is single threaded, so everything that touches it is funnelled
//! through one crossbeam channel and handled on the thread running `Mux::run`:
//! 	captured datagrams from the capture thread
//! 	handler connects, disconnects and route changes from the client threads
//!
//! A handler's routes are remembered so that they can be dropped when it disconnects.
//! A handler can only remove routes it owns, never one another handler has taken over

mod capture;
mod client;

pub(crate) use capture::*;
pub(crate) use client::*;

use std::{
	collections::{HashMap, HashSet},
	net::Ipv4Addr,
	sync::atomic::{AtomicBool, Ordering},
	time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use interceptlib::{DelayTable, Descriptor, Router, RouterConfig, RouterError, RoutingKey};

pub(crate) enum Event {
	Packet(Vec<u8>),
	Connect(Descriptor, Sender<Vec<u8>>),
	Add(Descriptor, Ipv4Addr, u16),
	Del(Descriptor, Ipv4Addr, u16),
	Disconnect(Descriptor),
}

pub(crate) struct Mux {
	router: Router<DelayTable, Clients>,
	routes: HashMap<Descriptor, HashSet<(Ipv4Addr, u16)>>,
}

impl Mux {
	const TICK: Duration = Duration::from_millis(200);
	/// How often delayed packets nobody routed are reclaimed
	const EXPIRE_EVERY: Duration = Duration::from_secs(1);

	pub(crate) fn new(cfg: &RouterConfig) -> Result<Self, RouterError> {
		let buffer = DelayTable::from_config(cfg);
		let router = Router::new(cfg, buffer, Clients::default())?;
		Ok(Self {
			router,
			routes: HashMap::new(),
		})
	}

	pub(crate) fn handle(&mut self, event: Event) -> Result<(), RouterError> {
		match event {
			Event::Packet(buf) => {
				self.router.update(&buf)?;
			}
			Event::Connect(descriptor, sender) => {
				log::info!("client {} connected", descriptor);
				self.router.delivery_mut().register(descriptor, sender);
			}
			Event::Add(descriptor, address, port) => {
				self.routes
					.entry(descriptor)
					.or_default()
					.insert((address, port));
				self.router.add(address, port, descriptor)?;
			}
			Event::Del(descriptor, address, port) => {
				if let Some(owned) = self.routes.get_mut(&descriptor) {
					owned.remove(&(address, port));
				}
				if self.owns(descriptor, address, port) {
					self.router.del(address, port)?;
				} else {
					log::warn!(
						"client {} may not delete {}, routed elsewhere",
						descriptor,
						RoutingKey::from_endpoint(address, port)
					);
				}
			}
			Event::Disconnect(descriptor) => {
				log::info!("client {} disconnected", descriptor);
				for (address, port) in self.routes.remove(&descriptor).unwrap_or_default() {
					// another handler may have taken the endpoint over since
					if self.owns(descriptor, address, port) {
						self.router.del(address, port)?;
					}
				}
				self.router.delivery_mut().unregister(descriptor);
			}
		}
		Ok(())
	}

	/// Whether `address:port` is routed to `descriptor` or to nobody
	fn owns(&self, descriptor: Descriptor, address: Ipv4Addr, port: u16) -> bool {
		let key = RoutingKey::from_endpoint(address, port);
		match self.router.cache().and_then(|c| c.find(key)) {
			Some(current) => current == descriptor,
			None => true,
		}
	}

	/// Handle events until `keep_running` is cleared or every sender is gone
	pub(crate) fn run(
		&mut self,
		events: &Receiver<Event>,
		keep_running: &AtomicBool,
		sweep_every: Option<Duration>,
	) -> Result<(), RouterError> {
		let mut last_sweep = Instant::now();
		let mut last_expire = Instant::now();
		while keep_running.load(Ordering::SeqCst) {
			match events.recv_timeout(Self::TICK) {
				Ok(event) => self.handle(event)?,
				Err(RecvTimeoutError::Timeout) => {}
				Err(RecvTimeoutError::Disconnected) => break,
			}
			if let Some(every) = sweep_every {
				if last_sweep.elapsed() >= every {
					self.router.sweep()?;
					last_sweep = Instant::now();
					last_expire = last_sweep;
				}
			}
			if last_expire.elapsed() >= Self::EXPIRE_EVERY {
				self.router.expire_delayed()?;
				last_expire = Instant::now();
			}
		}
		Ok(())
	}

	pub(crate) fn shutdown(&mut self) {
		log::info!(
			"{:?}, clients: {}, frames dropped: {}, overlong chains: {}",
			self.router.stats(),
			self.router.delivery().len(),
			self.router.delivery().dropped(),
			self.router.cache().map_or(0, |c| c.overlong_chains())
		);
		self.router.destroy();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crossbeam::channel::bounded;

	const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

	fn datagram(dst_port: u16) -> Vec<u8> {
		let mut pkt: Vec<u8> = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0, 10, 0, 0, 2];
		pkt.extend_from_slice(&A.octets());
		pkt.extend_from_slice(&[0x9c, 0x40]);
		pkt.extend_from_slice(&dst_port.to_be_bytes());
		pkt.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x10, 0xff, 0xff, 0, 0, 0, 0]);
		pkt
	}

	fn mux() -> Mux {
		let cfg = RouterConfig {
			slots: 64,
			..Default::default()
		};
		Mux::new(&cfg).unwrap()
	}

	#[test]
	fn test_packets_reach_registered_handler() {
		let mut mux = mux();
		let fd = Descriptor::new(5);
		let (send, recv) = bounded(8);
		mux.handle(Event::Connect(fd, send)).unwrap();

		// arrives before the route
		mux.handle(Event::Packet(datagram(80))).unwrap();
		assert!(recv.try_recv().is_err());

		mux.handle(Event::Add(fd, A, 80)).unwrap();
		assert!(recv.try_recv().is_ok());

		mux.handle(Event::Packet(datagram(80))).unwrap();
		assert!(recv.try_recv().is_ok());
		assert_eq!(mux.router.stats().forwarded, 1);
		assert_eq!(mux.router.stats().flushed, 1);
	}

	#[test]
	fn test_disconnect_drops_owned_routes() {
		let mut mux = mux();
		let (one, two) = (Descriptor::new(5), Descriptor::new(6));
		let (send_one, _recv_one) = bounded(8);
		let (send_two, recv_two) = bounded(8);
		mux.handle(Event::Connect(one, send_one)).unwrap();
		mux.handle(Event::Connect(two, send_two)).unwrap();
		mux.handle(Event::Add(one, A, 80)).unwrap();
		mux.handle(Event::Add(one, A, 81)).unwrap();
		// two takes 81 over
		mux.handle(Event::Add(two, A, 81)).unwrap();

		mux.handle(Event::Disconnect(one)).unwrap();
		mux.handle(Event::Packet(datagram(80))).unwrap();
		mux.handle(Event::Packet(datagram(81))).unwrap();

		assert_eq!(mux.router.buffer().len(), 1);
		assert!(recv_two.try_recv().is_ok());
		assert_eq!(mux.router.delivery().len(), 1);
	}

	#[test]
	fn test_stale_disconnect_leaves_new_client_alone() {
		let mut mux = mux();
		let mut seq = DescriptorSeq::default();
		let (old, new) = (seq.next(), seq.next());
		let (send_old, recv_old) = bounded(8);
		let (send_new, recv_new) = bounded(8);
		mux.handle(Event::Connect(old, send_old)).unwrap();
		mux.handle(Event::Add(old, A, 80)).unwrap();
		// the old writer died, its socket fd is reused before its disconnect is seen
		drop(recv_old);
		mux.handle(Event::Connect(new, send_new)).unwrap();
		mux.handle(Event::Add(new, A, 81)).unwrap();
		mux.handle(Event::Disconnect(old)).unwrap();

		mux.handle(Event::Packet(datagram(81))).unwrap();
		assert!(recv_new.try_recv().is_ok());
		assert_eq!(mux.router.delivery().len(), 1);
		assert_eq!(mux.router.delivery().dropped(), 0);
	}

	#[test]
	fn test_del_of_route_taken_over_is_ignored() {
		let mut mux = mux();
		let (one, two) = (Descriptor::new(5), Descriptor::new(6));
		let (send_one, _recv_one) = bounded(8);
		let (send_two, recv_two) = bounded(8);
		mux.handle(Event::Connect(one, send_one)).unwrap();
		mux.handle(Event::Connect(two, send_two)).unwrap();
		mux.handle(Event::Add(one, A, 80)).unwrap();
		mux.handle(Event::Add(two, A, 80)).unwrap();

		mux.handle(Event::Del(one, A, 80)).unwrap();
		mux.handle(Event::Packet(datagram(80))).unwrap();
		assert!(recv_two.try_recv().is_ok());

		mux.handle(Event::Del(two, A, 80)).unwrap();
		mux.handle(Event::Packet(datagram(80))).unwrap();
		assert!(recv_two.try_recv().is_err());
		assert_eq!(mux.router.buffer().len(), 1);
	}

	#[test]
	fn test_del_of_unrouted_key_discards_delayed_packets() {
		let mut mux = mux();
		let fd = Descriptor::new(5);
		mux.handle(Event::Packet(datagram(80))).unwrap();
		mux.handle(Event::Del(fd, A, 80)).unwrap();
		assert!(mux.router.buffer().is_empty());
	}

	#[test]
	fn test_delay_table_follows_config() {
		let cfg = RouterConfig {
			slots: 64,
			max_buffered_per_key: 2,
			delay_timeout_secs: 7,
			..Default::default()
		};
		let mut mux = Mux::new(&cfg).unwrap();
		assert_eq!(mux.router.buffer().max_age(), 7);
		for _ in 0..3 {
			mux.handle(Event::Packet(datagram(80))).unwrap();
		}
		assert_eq!(mux.router.buffer().pending(RoutingKey::from_endpoint(A, 80)), 2);
		assert_eq!(mux.router.stats().buffered, 3);
	}

	#[test]
	fn test_run_stops_when_senders_are_gone() {
		let mut mux = mux();
		let (send, recv) = bounded(4);
		send.send(Event::Packet(datagram(80))).unwrap();
		drop(send);
		let keep_running = AtomicBool::new(true);
		mux.run(&recv, &keep_running, Some(Duration::from_millis(1)))
			.unwrap();
		assert_eq!(mux.router.stats().buffered, 1);

		mux.shutdown();
		assert!(mux.router.is_destroyed());
		mux.shutdown();
	}
}
