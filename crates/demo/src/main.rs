//! Mirage demo binary.
//!
//! Plays a short threads/posts session against a simulated server with network
//! latency, logging every apparent value the UI would render. Placeholders show
//! up as soon as a write is issued and are replaced once the server's data
//! catches up.

mod api;
mod config;
mod server;
mod session;
mod transport;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use crate::config::DemoConfig;

/// Demo command line arguments.
#[derive(Parser, Debug)]
#[command(name = "mirage-demo")]
#[command(about = "Simulated session showing speculative overlays converge")]
struct Args {
	/// TOML configuration file
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Seed for latency jitter
	#[arg(long)]
	seed: Option<u64>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	let mut config = DemoConfig::load(args.config.as_deref())?;
	if args.seed.is_some() {
		config.seed = args.seed;
	}
	info!(?config, "starting mirage-demo");

	let snapshot = session::run(config).await?;
	print!("{snapshot}");
	Ok(())
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::prelude::*;

	let default_filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("mirage_overlay=trace,mirage_demo=debug,info")
			} else {
				EnvFilter::new("mirage_overlay=debug,info")
			}
		})
	};

	// MIRAGE_LOG_DIR mirrors the log into a per-process file.
	if let Some(log_dir) = std::env::var("MIRAGE_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("mirage-demo.{}.log", std::process::id()));
		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_target(true);
			tracing_subscriber::registry()
				.with(default_filter())
				.with(file_layer)
				.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
				.init();
			info!(path = ?log_path, "tracing initialized");
			return;
		}
	}

	tracing_subscriber::registry()
		.with(default_filter())
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.init();
}
