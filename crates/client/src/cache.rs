//! Per-channel property cache with optimistic writes.
//!
//! The cache serves three contracts at once: low-latency reads out of a
//! write-through map, apparently-synchronous writes while the daemon round
//! trip runs in the background, and convergence when the daemon rejects a
//! write, a newer write cancels an older one, or another client changes the
//! same property concurrently.
//!
//! The moving part is the shadow table. While a write for a property is in
//! flight from this cache, `shadow_prior` holds the pre-write value for
//! rollback and gates daemon-originated change events for that property:
//! such an event is either the echo of our own not-yet-reconciled write or
//! races a cancelled one, and in both cases the write's reply path is the
//! one that reconciles the cache.
//!
//! Per property the cache moves through four states: absent, cached,
//! write-pending, and write-pending-after-reissue. A reply commits or rolls
//! back the pending value; a newer `set` cancels the outstanding call but
//! keeps the original prior, so a later rollback lands on the value from
//! before the first write, not a speculative intermediate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use settled_proto::errors::Error;
use settled_proto::name::{validate_property, validate_property_base};
use settled_proto::types::{Event, RequestId, RequestPayload, ResponsePayload};
use settled_proto::value::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::Client;

/// Capacity of the local-event broadcast buffer.
const EVENT_BUFFER: usize = 256;

/// Local notification that a property's observable value changed.
///
/// Emitted for optimistic writes, rollbacks, and daemon-originated changes
/// alike; [`Value::Empty`] reports a disappeared property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEvent {
	/// The channel the property lives on.
	pub channel: String,
	/// The property path.
	pub property: String,
	/// The new observable value.
	pub value: Value,
}

#[derive(Debug, Clone)]
struct CacheItem {
	value: Value,
}

/// Bookkeeping for one write in flight from this cache.
struct PendingWrite {
	property: String,
	/// The cache entry from before the first write, `None` when the
	/// property was absent. Survives cancel-and-reissue.
	prior: Option<CacheItem>,
	call: RequestId,
}

#[derive(Default)]
struct CacheState {
	properties: BTreeMap<String, CacheItem>,
	/// Call handle → property, for writes awaiting a reply.
	pending_calls: HashMap<RequestId, String>,
	/// Property → pending write. An entry exists exactly while a write for
	/// that property is in flight from this cache.
	shadow_prior: HashMap<String, PendingWrite>,
	/// Reply waiter tasks, drained at close.
	reply_tasks: HashMap<RequestId, JoinHandle<()>>,
	closing: bool,
}

struct CacheInner {
	client: Client,
	channel_name: String,
	state: Mutex<CacheState>,
	events: broadcast::Sender<PropertyEvent>,
}

/// Write-through property cache for a single channel.
pub struct Cache {
	inner: Arc<CacheInner>,
	event_task: JoinHandle<()>,
}

impl Cache {
	/// Creates a cache for `channel_name` on top of `client`.
	///
	/// Must run inside a tokio runtime; the cache listens to the client's
	/// daemon events until [`Cache::close`] or drop.
	#[must_use]
	pub fn new(client: Client, channel_name: impl Into<String>) -> Self {
		let channel_name = channel_name.into();
		let (events, _) = broadcast::channel(EVENT_BUFFER);

		let inner = Arc::new(CacheInner {
			client: client.clone(),
			channel_name,
			state: Mutex::new(CacheState::default()),
			events,
		});

		let listener = Arc::clone(&inner);
		let mut daemon_events = client.events();
		let event_task = tokio::spawn(async move {
			loop {
				match daemon_events.recv().await {
					Ok(event) => listener.on_daemon_event(event).await,
					Err(broadcast::error::RecvError::Lagged(missed)) => {
						warn!(
							channel = %listener.channel_name,
							missed, "daemon event stream lagged",
						);
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});

		Self { inner, event_task }
	}

	/// The channel this cache serves.
	#[must_use]
	pub fn channel_name(&self) -> &str {
		&self.inner.channel_name
	}

	/// A fresh subscription to local change events.
	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<PropertyEvent> {
		self.inner.events.subscribe()
	}

	/// Warms the cache with every property under `property_base`.
	///
	/// Only permitted while the cache is empty.
	pub async fn prefetch(&self, property_base: &str) -> Result<(), Error> {
		validate_property_base(property_base)?;
		let mut state = self.inner.state.lock().await;

		if !state.properties.is_empty() {
			return Err(Error::internal("prefetch requires an empty cache"));
		}

		let base = if property_base.is_empty() {
			"/"
		} else {
			property_base
		};
		let payload = self
			.inner
			.client
			.call(RequestPayload::GetAllProperties {
				channel: self.inner.channel_name.clone(),
				property_base: base.to_string(),
			})
			.await?;

		match payload {
			ResponsePayload::Properties(props) => {
				for (property, value) in props {
					state.properties.insert(property, CacheItem { value });
				}
				Ok(())
			}
			other => Err(Error::internal(format!(
				"unexpected response to GetAllProperties: {other:?}"
			))),
		}
	}

	/// The cached value of `property`, fetching it from the daemon on a
	/// miss.
	///
	/// Returns `Ok(None)` when the property does not exist; other daemon
	/// failures surface.
	pub async fn lookup(&self, property: &str) -> Result<Option<Value>, Error> {
		validate_property(property)?;
		let mut state = self.inner.state.lock().await;
		self.inner.lookup_locked(&mut state, property).await
	}

	/// Stores `value` at `property`: updates the cache immediately and lets
	/// the daemon write run in the background.
	///
	/// Success means the write was issued; a daemon rejection later rolls
	/// the cache back and reports the old value through a local change
	/// event rather than an error here.
	pub async fn set(&self, property: &str, value: Value) -> Result<(), Error> {
		validate_property(property)?;
		let inner = &self.inner;
		let mut state = inner.state.lock().await;

		// Resolve the prior value. A property the daemon has never heard of
		// is fine; anything else wrong aborts the write.
		let prior_value = if let Some(item) = state.properties.get(property) {
			Some(item.value.clone())
		} else {
			match inner.lookup_locked(&mut state, property).await {
				Ok(found) => found,
				Err(e) if e.is_not_found() => None,
				Err(e) => return Err(e),
			}
		};

		// Nothing to do when the value isn't changing.
		if prior_value.as_ref() == Some(&value) {
			return Ok(());
		}

		if let Some(pending) = state.shadow_prior.get(property) {
			// A previous write is still in flight. Cancel it and throw away
			// the not-yet-committed value; the entry keeps the original
			// prior so a failure of the new write rolls back all the way.
			let cancelled = pending.call;
			inner.client.cancel(cancelled);
			state.pending_calls.remove(&cancelled);
		} else {
			let prior = state.properties.get(property).cloned();
			state.shadow_prior.insert(
				property.to_string(),
				PendingWrite {
					property: property.to_string(),
					prior,
					call: RequestId(0),
				},
			);
		}

		let call = match inner
			.client
			.begin_call(RequestPayload::SetProperty {
				channel: inner.channel_name.clone(),
				property: property.to_string(),
				value: value.clone(),
			})
			.await
		{
			Ok(call) => call,
			Err(e) => {
				// No write is in flight anymore; drop the shadow entry so
				// daemon events for this property flow again.
				state.shadow_prior.remove(property);
				return Err(e);
			}
		};

		let call_id = call.id;
		if let Some(pending) = state.shadow_prior.get_mut(property) {
			pending.call = call_id;
		}
		state.pending_calls.insert(call_id, property.to_string());

		// Optimistic local update; observers see the new value now.
		state
			.properties
			.insert(property.to_string(), CacheItem {
				value: value.clone(),
			});

		let waiter = Arc::clone(inner);
		let task = tokio::spawn(async move {
			let reply = call.reply().await;
			waiter.reconcile(call_id, reply).await;
		});
		state.reply_tasks.insert(call_id, task);

		drop(state);
		inner.emit(property.to_string(), value);
		Ok(())
	}

	/// Synchronously resets `property_base` on the daemon and evicts the
	/// affected entries.
	///
	/// Synchronous on purpose: whether a reset removes the key or reveals a
	/// system default is only known once the daemon has answered, and
	/// existence checks depend on that.
	pub async fn reset(&self, property_base: &str, recursive: bool) -> Result<(), Error> {
		validate_property_base(property_base)?;
		let inner = &self.inner;
		let mut state = inner.state.lock().await;

		inner
			.client
			.call(RequestPayload::ResetProperty {
				channel: inner.channel_name.clone(),
				property: property_base.to_string(),
				recursive,
			})
			.await?;

		if property_base.is_empty() || property_base == "/" {
			state.properties.clear();
		} else {
			state.properties.remove(property_base);
			if recursive {
				let prefix = format!("{property_base}/");
				state.properties.retain(|path, _| !path.starts_with(&prefix));
			}
		}
		Ok(())
	}

	/// Disconnects from daemon events and drains in-flight writes.
	///
	/// Each outstanding reply is awaited; failures are logged instead of
	/// rolling back, and no local change events are emitted.
	pub async fn close(&self) {
		self.event_task.abort();

		let tasks: Vec<JoinHandle<()>> = {
			let mut state = self.inner.state.lock().await;
			state.closing = true;
			state.reply_tasks.drain().map(|(_, task)| task).collect()
		};

		for task in tasks {
			let _ = task.await;
		}
	}
}

impl Drop for Cache {
	fn drop(&mut self) {
		self.event_task.abort();
	}
}

impl CacheInner {
	fn emit(&self, property: String, value: Value) {
		let _ = self.events.send(PropertyEvent {
			channel: self.channel_name.clone(),
			property,
			value,
		});
	}

	/// Cache hit, or a blocking daemon fetch under the lock.
	async fn lookup_locked(
		&self,
		state: &mut CacheState,
		property: &str,
	) -> Result<Option<Value>, Error> {
		if let Some(item) = state.properties.get(property) {
			return Ok(Some(item.value.clone()));
		}

		match self
			.client
			.call(RequestPayload::GetProperty {
				channel: self.channel_name.clone(),
				property: property.to_string(),
			})
			.await
		{
			Ok(ResponsePayload::Value(value)) => {
				state
					.properties
					.insert(property.to_string(), CacheItem {
						value: value.clone(),
					});
				Ok(Some(value))
			}
			Ok(other) => Err(Error::internal(format!(
				"unexpected response to GetProperty: {other:?}"
			))),
			Err(Error::PropertyNotFound { .. }) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Reply handling for a pending write: commit or roll back.
	async fn reconcile(
		self: &Arc<Self>,
		call: RequestId,
		reply: Option<Result<ResponsePayload, Error>>,
	) {
		let mut state = self.state.lock().await;
		state.reply_tasks.remove(&call);

		// Cancelled and superseded calls are gone from the table; their
		// replies are stale.
		let Some(property) = state.pending_calls.remove(&call) else {
			return;
		};
		let Some(pending) = state.shadow_prior.remove(&property) else {
			debug!(property = %property, "pending write without a shadow entry");
			return;
		};

		if state.closing {
			if let Some(Err(e)) = reply {
				warn!(
					channel = %self.channel_name,
					property = %pending.property,
					error = %e,
					"failed to set property",
				);
			}
			return;
		}

		match reply {
			Some(Ok(_)) => {
				// The optimistic local state was right all along.
			}
			reply => {
				if let Some(Err(e)) = reply {
					warn!(
						channel = %self.channel_name,
						property = %pending.property,
						error = %e,
						"failed to set property, reverting",
					);
				}

				// Restore the pre-write value and let observers re-converge.
				let rollback = match pending.prior {
					Some(item) => {
						let value = item.value.clone();
						state.properties.insert(property.clone(), item);
						value
					}
					None => {
						state.properties.remove(&property);
						Value::Empty
					}
				};
				drop(state);
				self.emit(property, rollback);
			}
		}
	}

	async fn on_daemon_event(&self, event: Event) {
		if event.channel() != self.channel_name {
			return;
		}

		match event {
			Event::PropertyChanged {
				property, value, ..
			} => {
				let mut state = self.state.lock().await;

				// A write for this property is in flight from here: the
				// event is our own echo, or races a cancelled call that the
				// reply path will reconcile. Drop it either way.
				if state.shadow_prior.contains_key(&property) {
					return;
				}

				let changed = match state.properties.get_mut(&property) {
					Some(item) => {
						if item.value == value {
							false
						} else {
							item.value = value.clone();
							true
						}
					}
					None => {
						state.properties.insert(property.clone(), CacheItem {
							value: value.clone(),
						});
						true
					}
				};

				drop(state);
				if changed {
					self.emit(property, value);
				}
			}
			Event::PropertyRemoved { property, .. } => {
				let mut state = self.state.lock().await;
				state.properties.remove(&property);
				drop(state);
				self.emit(property, Value::Empty);
			}
		}
	}
}
