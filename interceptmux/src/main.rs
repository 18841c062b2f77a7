mod config;
mod mux;

use anyhow::{Context, Result};
use config::MuxConfig;
use crossbeam::channel::bounded;
use mux::*;

use std::{
	env,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread::spawn,
};

/// Handle Ctrl+C
fn handle_signal(kr: Arc<AtomicBool>) -> Result<()> {
	ctrlc::set_handler(move || {
		kr.store(false, Ordering::SeqCst);
	})
	.context("Error setting Ctrl-C handler")
}

fn main() -> Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let path = env::args_os().nth(1).map(PathBuf::from);
	let cfg = MuxConfig::load(path.as_deref())?;

	// without a route table there is nothing to do
	let mut mux = Mux::new(&cfg.router).context("failed to create the router")?;
	#[cfg(feature = "debug")]
	println!("mux created");

	let (events, recv) = bounded(cfg.event_capacity);
	let keep_running = Arc::new(AtomicBool::new(true));
	handle_signal(keep_running.clone())?;

	{
		let events = events.clone();
		let socket_path = cfg.socket_path.clone();
		let capacity = cfg.client_capacity;
		spawn(move || {
			if let Err(e) = listen(&socket_path, capacity, events) {
				log::error!("client listener exited: {:#}", e);
			}
		});
	}

	{
		let kr = keep_running.clone();
		let buf_size = cfg.capture_buffer;
		spawn(move || {
			if let Err(e) = capture(buf_size, events, kr.clone()) {
				log::error!("{:#}", e);
				kr.store(false, Ordering::SeqCst);
			}
		});
	}

	#[cfg(feature = "debug")]
	println!("main loop starting");
	mux.run(&recv, &keep_running, cfg.sweep_interval())?;
	mux.shutdown();
	Ok(())
}
