#![warn(missing_docs)]

//! Client library for the settled configuration daemon.
//!
//! Applications read and write their settings through a [`Channel`]: a named
//! namespace of slash-separated, typed properties. Reads are served from a
//! per-channel write-through [`Cache`]; writes apply locally at once while
//! the daemon round trip runs in the background, rolling back (observably)
//! if the daemon rejects them. Change events cover both local writes and
//! changes made by other clients.
//!
//! Connections can be explicit ([`Client::connect`] plus [`Channel::new`])
//! or process-global: [`init`] once, then open channels with [`channel`];
//! channels obtained that way share one cache per channel name. [`init`] may
//! be called multiple times, and [`shutdown`] must then be called an equal
//! number of times.

pub mod cache;
pub mod channel;
pub mod client;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

pub use cache::{Cache, PropertyEvent};
pub use channel::{Channel, register_named_struct};
pub use client::Client;
pub use settled_proto as proto;
pub use settled_proto::errors::Error;
pub use settled_proto::value::{Value, ValueKind};

struct Global {
	client: Client,
	channels: HashMap<String, Arc<Cache>>,
	refcount: usize,
}

static GLOBAL: tokio::sync::Mutex<Option<Global>> = tokio::sync::Mutex::const_new(None);

/// Initializes the process-global daemon connection.
///
/// `socket_path` of `None` resolves the default socket. Calling this again
/// while initialized only bumps a reference count.
pub async fn init(socket_path: Option<&Path>) -> Result<(), Error> {
	let mut global = GLOBAL.lock().await;

	if let Some(global) = global.as_mut() {
		global.refcount += 1;
		return Ok(());
	}

	let client = match socket_path {
		Some(path) => Client::connect(path).await?,
		None => Client::connect(settled_proto::paths::default_socket_path()).await?,
	};

	*global = Some(Global {
		client,
		channels: HashMap::new(),
		refcount: 1,
	});
	Ok(())
}

/// Releases one reference to the global connection.
///
/// The final release drains every shared cache's in-flight writes and drops
/// the connection.
pub async fn shutdown() {
	let taken = {
		let mut global = GLOBAL.lock().await;
		match global.as_mut() {
			None => {
				debug!("shutdown without a matching init");
				return;
			}
			Some(g) if g.refcount > 1 => {
				g.refcount -= 1;
				return;
			}
			Some(_) => global.take(),
		}
	};

	if let Some(global) = taken {
		for (_, cache) in global.channels {
			cache.close().await;
		}
	}
}

/// Opens `channel_name` on the global connection.
///
/// Channels for the same name share one cache, so their reads and change
/// events stay coherent. Fails until [`init`] has been called.
pub async fn channel(channel_name: &str) -> Result<Channel, Error> {
	let mut global = GLOBAL.lock().await;
	let Some(global) = global.as_mut() else {
		return Err(Error::internal(
			"settled_client::init() must be called before opening channels",
		));
	};

	let client = global.client.clone();
	let cache = global
		.channels
		.entry(channel_name.to_string())
		.or_insert_with(|| Arc::new(Cache::new(client.clone(), channel_name)))
		.clone();

	Ok(Channel::from_parts(client, cache))
}
