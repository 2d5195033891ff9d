//! settled daemon binary.
//!
//! The daemon runs as a per-user-session process and owns the on-disk
//! configuration stores. Clients talk to it over a Unix domain socket; the
//! socket path doubles as the well-known service name, so a second instance
//! exits cleanly instead of competing for the files.

use std::path::PathBuf;

use clap::Parser;
use settled_daemon::core::DaemonCore;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "settled")]
#[command(about = "Per-user configuration storage daemon")]
struct Args {
	/// Socket path for IPC
	#[arg(short, long, value_name = "PATH")]
	socket: Option<PathBuf>,

	/// Backends to start, in lookup order
	#[arg(short, long, value_name = "ID", default_values_t = [String::from("perchannel-xml")])]
	backends: Vec<String>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_max_level(if args.verbose {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.init();

	info!("starting settled");

	let socket_path = args
		.socket
		.unwrap_or_else(settled_proto::paths::default_socket_path);

	if let Some(parent) = socket_path.parent()
		&& !parent.exists()
	{
		std::fs::create_dir_all(parent)?;
	}

	info!(socket = %socket_path.display(), "IPC socket path");

	let core = DaemonCore::new(&args.backends)?;
	let shutdown = CancellationToken::new();

	let signal_shutdown = shutdown.clone();
	tokio::spawn(async move {
		let mut sigterm =
			match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
				Ok(s) => s,
				Err(e) => {
					tracing::error!(error = %e, "failed to install SIGTERM handler");
					return;
				}
			};
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = sigterm.recv() => {}
		}
		info!("shutdown requested");
		signal_shutdown.cancel();
	});

	info!("starting IPC server");
	settled_daemon::ipc::serve(&socket_path, core, shutdown).await?;

	info!("settled exiting");
	Ok(())
}
