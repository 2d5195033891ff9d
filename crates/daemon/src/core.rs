//! The daemon core: backend multiplexing and change fan-out.
//!
//! [`DaemonCore`] owns the ordered backend list and routes every request
//! across it:
//!
//! - Reads (`get`, `exists`, `get_all`) consult backends in order; the first
//!   success wins and the last error is reported when all fail. `get_all`
//!   merges results with first-seen keys winning.
//! - Writes commit to the first backend only, and only when no backend
//!   reports the property locked.
//! - Resets apply to every backend so a removed entry cannot resurface from
//!   a stale lower layer; they succeed when any backend succeeds.
//!
//! Backend change callbacks run inside the mutating request. The core only
//! enqueues a small record there; a pump task picks it up on a later
//! scheduler turn, re-reads the effective value from the originating backend
//! and emits [`Event::PropertyChanged`] or [`Event::PropertyRemoved`] to
//! every subscribed session. The core itself caches no values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use settled_proto::errors::Error;
use settled_proto::name::{validate_channel, validate_property, validate_property_base};
use settled_proto::types::{Event, IpcFrame, RequestPayload, ResponsePayload};
use settled_proto::value::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::registry::BackendRegistry;

/// Unique identifier for connected sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Sink for delivering frames to a connected session.
pub type SessionSink = mpsc::UnboundedSender<IpcFrame>;

struct SessionEntry {
	sink: SessionSink,
	subscribed: bool,
}

/// A change noticed by a backend, awaiting deferred emission.
struct PendingChange {
	backend: usize,
	channel: String,
	property: String,
}

struct CoreState {
	backends: Vec<Box<dyn Backend>>,
	sessions: HashMap<SessionId, SessionEntry>,
	next_session_id: u64,
}

/// Shared state for the daemon.
pub struct DaemonCore {
	state: Mutex<CoreState>,
	changes_tx: mpsc::UnboundedSender<PendingChange>,
	changes_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingChange>>>,
}

impl DaemonCore {
	/// Builds a core from backend identifiers.
	///
	/// Identifiers that fail to construct are logged and skipped; if none
	/// survive the daemon cannot run and [`Error::NoBackend`] is returned.
	pub fn new(backend_ids: &[String]) -> Result<Arc<Self>, Error> {
		let registry = BackendRegistry::new();
		let mut backends = Vec::new();

		for id in backend_ids {
			match registry.create(id) {
				Ok(backend) => backends.push(backend),
				Err(e) => warn!(id = %id, error = %e, "unable to start backend"),
			}
		}

		Self::with_backends(backends)
	}

	/// Builds a core around already-initialized backends.
	pub fn with_backends(backends: Vec<Box<dyn Backend>>) -> Result<Arc<Self>, Error> {
		if backends.is_empty() {
			return Err(Error::NoBackend);
		}

		let (changes_tx, changes_rx) = mpsc::unbounded_channel();
		let core = Arc::new(Self {
			state: Mutex::new(CoreState {
				backends,
				sessions: HashMap::new(),
				next_session_id: 1,
			}),
			changes_tx,
			changes_rx: Mutex::new(Some(changes_rx)),
		});

		{
			let mut state = core.state.lock().unwrap();
			for (index, backend) in state.backends.iter_mut().enumerate() {
				let tx = core.changes_tx.clone();
				backend.register_change_callback(Box::new(move |channel, property| {
					let _ = tx.send(PendingChange {
						backend: index,
						channel: channel.to_string(),
						property: property.to_string(),
					});
				}));
			}
		}

		Ok(core)
	}

	/// Starts the deferred change emission task.
	///
	/// Must run inside a tokio runtime. Subsequent calls are no-ops.
	pub fn spawn_change_pump(self: &Arc<Self>) {
		let Some(mut rx) = self.changes_rx.lock().unwrap().take() else {
			return;
		};
		let core = Arc::clone(self);
		tokio::spawn(async move {
			while let Some(change) = rx.recv().await {
				core.emit_change(&change);
			}
		});
	}

	/// Registers a connected session and returns its id.
	pub fn register_session(&self, sink: SessionSink) -> SessionId {
		let mut state = self.state.lock().unwrap();
		let id = SessionId(state.next_session_id);
		state.next_session_id += 1;
		state.sessions.insert(
			id,
			SessionEntry {
				sink,
				subscribed: false,
			},
		);
		debug!(session = id.0, "session registered");
		id
	}

	/// Removes a session; pending events for it are dropped.
	pub fn unregister_session(&self, session: SessionId) {
		let mut state = self.state.lock().unwrap();
		if state.sessions.remove(&session).is_some() {
			debug!(session = session.0, "session unregistered");
		}
	}

	/// Dispatches one request on behalf of `session`.
	pub fn handle_request(
		&self,
		session: SessionId,
		payload: RequestPayload,
	) -> Result<ResponsePayload, Error> {
		match payload {
			RequestPayload::SetProperty {
				channel,
				property,
				value,
			} => {
				validate_channel(&channel)?;
				validate_property(&property)?;
				self.set_property(&channel, &property, value)?;
				Ok(ResponsePayload::Done)
			}
			RequestPayload::GetProperty { channel, property } => {
				validate_channel(&channel)?;
				validate_property(&property)?;
				self.get_property(&channel, &property).map(ResponsePayload::Value)
			}
			RequestPayload::GetAllProperties {
				channel,
				property_base,
			} => {
				validate_channel(&channel)?;
				validate_property_base(&property_base)?;
				self.get_all_properties(&channel, &property_base)
					.map(ResponsePayload::Properties)
			}
			RequestPayload::PropertyExists { channel, property } => {
				validate_channel(&channel)?;
				validate_property(&property)?;
				self.property_exists(&channel, &property).map(ResponsePayload::Exists)
			}
			RequestPayload::ResetProperty {
				channel,
				property,
				recursive,
			} => {
				validate_channel(&channel)?;
				if property.is_empty() || property == "/" {
					if !recursive {
						return Err(Error::InvalidProperty {
							message: "the property name can only be empty or \"/\" if a \
							          recursive reset was specified"
								.into(),
						});
					}
				} else {
					validate_property(&property)?;
				}
				self.reset_property(&channel, &property, recursive)?;
				Ok(ResponsePayload::Done)
			}
			RequestPayload::ListChannels => self.list_channels().map(ResponsePayload::Channels),
			RequestPayload::IsPropertyLocked { channel, property } => {
				validate_channel(&channel)?;
				validate_property(&property)?;
				self.is_property_locked(&channel, &property)
					.map(ResponsePayload::Locked)
			}
			RequestPayload::Subscribe => {
				let mut state = self.state.lock().unwrap();
				if let Some(entry) = state.sessions.get_mut(&session) {
					entry.subscribed = true;
				}
				Ok(ResponsePayload::Subscribed)
			}
		}
	}

	fn set_property(&self, channel: &str, property: &str, value: Value) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();

		// A property is writable only if no backend reports it locked.
		for backend in state.backends.iter_mut() {
			if backend.is_property_locked(channel, property)? {
				return Err(Error::PermissionDenied {
					channel: channel.to_string(),
					property: property.to_string(),
				});
			}
		}

		// Writes commit to the first backend only.
		state.backends[0].set(channel, property, value)
	}

	fn get_property(&self, channel: &str, property: &str) -> Result<Value, Error> {
		let mut state = self.state.lock().unwrap();
		let mut last_error = None;

		for backend in state.backends.iter_mut() {
			match backend.get(channel, property) {
				Ok(value) => return Ok(value),
				Err(e) => last_error = Some(e),
			}
		}

		Err(last_error.unwrap_or_else(|| Error::internal("no backends configured")))
	}

	fn get_all_properties(
		&self,
		channel: &str,
		property_base: &str,
	) -> Result<BTreeMap<String, Value>, Error> {
		let mut state = self.state.lock().unwrap();
		let mut merged = BTreeMap::new();
		let mut succeeded = false;
		let mut last_error = None;

		for backend in state.backends.iter_mut() {
			match backend.get_all(channel, property_base) {
				Ok(props) => {
					succeeded = true;
					for (path, value) in props {
						merged.entry(path).or_insert(value);
					}
				}
				Err(e) => last_error = Some(e),
			}
		}

		if succeeded {
			Ok(merged)
		} else {
			Err(last_error.unwrap_or_else(|| Error::internal("no backends configured")))
		}
	}

	fn property_exists(&self, channel: &str, property: &str) -> Result<bool, Error> {
		let mut state = self.state.lock().unwrap();
		let mut exists = false;
		let mut succeeded = false;
		let mut last_error = None;

		for backend in state.backends.iter_mut() {
			if exists {
				break;
			}
			match backend.exists(channel, property) {
				Ok(e) => {
					succeeded = true;
					exists = e;
				}
				Err(e) => last_error = Some(e),
			}
		}

		if succeeded {
			Ok(exists)
		} else {
			Err(last_error.unwrap_or_else(|| Error::internal("no backends configured")))
		}
	}

	fn reset_property(&self, channel: &str, property: &str, recursive: bool) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		let mut succeeded = false;
		let mut last_error = None;

		// All backends but the first are effectively read-only, but the
		// reset still has to reach every layer so the property cannot
		// resurface from a stale one within this process.
		for backend in state.backends.iter_mut() {
			match backend.reset(channel, property, recursive) {
				Ok(()) => succeeded = true,
				Err(e) => last_error = Some(e),
			}
		}

		if succeeded {
			Ok(())
		} else {
			Err(last_error.unwrap_or_else(|| Error::internal("no backends configured")))
		}
	}

	fn list_channels(&self) -> Result<Vec<String>, Error> {
		let mut state = self.state.lock().unwrap();
		let mut channels = BTreeSet::new();
		let mut succeeded = false;
		let mut last_error = None;

		for backend in state.backends.iter_mut() {
			match backend.list_channels() {
				Ok(list) => {
					succeeded = true;
					channels.extend(list);
				}
				Err(e) => last_error = Some(e),
			}
		}

		if succeeded {
			Ok(channels.into_iter().collect())
		} else {
			Err(last_error.unwrap_or_else(|| Error::internal("no backends configured")))
		}
	}

	fn is_property_locked(&self, channel: &str, property: &str) -> Result<bool, Error> {
		let mut state = self.state.lock().unwrap();
		let mut locked = false;
		let mut succeeded = false;
		let mut last_error = None;

		for backend in state.backends.iter_mut() {
			if locked {
				break;
			}
			match backend.is_property_locked(channel, property) {
				Ok(l) => {
					succeeded = true;
					locked = l;
				}
				Err(e) => last_error = Some(e),
			}
		}

		if succeeded {
			Ok(locked)
		} else {
			Err(last_error.unwrap_or_else(|| Error::internal("no backends configured")))
		}
	}

	/// Persists every backend, logging failures.
	pub fn flush_all(&self) {
		let mut state = self.state.lock().unwrap();
		for backend in state.backends.iter_mut() {
			if let Err(e) = backend.flush() {
				warn!(backend = backend.id(), error = %e, "failed to flush backend");
			}
		}
	}

	/// Re-reads a changed property and fans the event out to subscribers.
	fn emit_change(&self, change: &PendingChange) {
		let (result, sinks) = {
			let mut state = self.state.lock().unwrap();
			let Some(backend) = state.backends.get_mut(change.backend) else {
				return;
			};
			let result = backend.get(&change.channel, &change.property);

			let sinks: Vec<(SessionId, SessionSink)> = state
				.sessions
				.iter()
				.filter(|(_, entry)| entry.subscribed)
				.map(|(id, entry)| (*id, entry.sink.clone()))
				.collect();
			(result, sinks)
		};

		let event = match result {
			Ok(value) => Event::PropertyChanged {
				channel: change.channel.clone(),
				property: change.property.clone(),
				value,
			},
			Err(e) if e.is_not_found() => Event::PropertyRemoved {
				channel: change.channel.clone(),
				property: change.property.clone(),
			},
			Err(e) => {
				warn!(
					channel = %change.channel,
					property = %change.property,
					error = %e,
					"failed to read back changed property",
				);
				return;
			}
		};

		let frame = IpcFrame::Event(event);
		for (session, sink) in sinks {
			if sink.send(frame.clone()).is_err() {
				self.unregister_session(session);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use crate::backend::ChangeCallback;

	use super::*;

	/// In-memory backend used to exercise multi-backend routing.
	struct MemoryBackend {
		props: BTreeMap<(String, String), Value>,
		locked: HashSet<(String, String)>,
		on_change: Option<ChangeCallback>,
	}

	impl MemoryBackend {
		fn new(props: &[(&str, &str, Value)], locked: &[(&str, &str)]) -> Self {
			Self {
				props: props
					.iter()
					.map(|(c, p, v)| ((c.to_string(), p.to_string()), v.clone()))
					.collect(),
				locked: locked
					.iter()
					.map(|(c, p)| (c.to_string(), p.to_string()))
					.collect(),
				on_change: None,
			}
		}
	}

	impl Backend for MemoryBackend {
		fn id(&self) -> &'static str {
			"memory"
		}

		fn initialize(&mut self) -> Result<(), Error> {
			Ok(())
		}

		fn set(&mut self, channel: &str, property: &str, value: Value) -> Result<(), Error> {
			self.props
				.insert((channel.to_string(), property.to_string()), value);
			if let Some(callback) = &self.on_change {
				callback(channel, property);
			}
			Ok(())
		}

		fn get(&mut self, channel: &str, property: &str) -> Result<Value, Error> {
			self.props
				.get(&(channel.to_string(), property.to_string()))
				.cloned()
				.ok_or_else(|| Error::PropertyNotFound {
					channel: channel.to_string(),
					property: property.to_string(),
				})
		}

		fn get_all(
			&mut self,
			channel: &str,
			_property_base: &str,
		) -> Result<BTreeMap<String, Value>, Error> {
			Ok(self
				.props
				.iter()
				.filter(|((c, _), _)| c == channel)
				.map(|((_, p), v)| (p.clone(), v.clone()))
				.collect())
		}

		fn exists(&mut self, channel: &str, property: &str) -> Result<bool, Error> {
			Ok(self
				.props
				.contains_key(&(channel.to_string(), property.to_string())))
		}

		fn reset(&mut self, channel: &str, property: &str, recursive: bool) -> Result<(), Error> {
			let base = format!("{property}/");
			let removed: Vec<(String, String)> = self
				.props
				.keys()
				.filter(|(c, p)| {
					c == channel && (p == property || (recursive && p.starts_with(&base)))
				})
				.cloned()
				.collect();
			for key in &removed {
				self.props.remove(key);
				if let Some(callback) = &self.on_change {
					callback(&key.0, &key.1);
				}
			}
			Ok(())
		}

		fn list_channels(&mut self) -> Result<Vec<String>, Error> {
			Ok(self.props.keys().map(|(c, _)| c.clone()).collect())
		}

		fn is_property_locked(&mut self, channel: &str, property: &str) -> Result<bool, Error> {
			Ok(self
				.locked
				.contains(&(channel.to_string(), property.to_string())))
		}

		fn flush(&mut self) -> Result<(), Error> {
			Ok(())
		}

		fn register_change_callback(&mut self, callback: ChangeCallback) {
			self.on_change = Some(callback);
		}
	}

	fn payload(result: Result<ResponsePayload, Error>) -> ResponsePayload {
		result.expect("request should succeed")
	}

	#[test]
	fn no_backends_refuses_to_start() {
		assert!(matches!(
			DaemonCore::with_backends(Vec::new()),
			Err(Error::NoBackend)
		));
	}

	#[test]
	fn reads_prefer_the_first_backend() {
		let core = DaemonCore::with_backends(vec![
			Box::new(MemoryBackend::new(&[("ch", "/p", Value::Int(1))], &[])),
			Box::new(MemoryBackend::new(&[("ch", "/p", Value::Int(2))], &[])),
		])
		.unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		let got = payload(core.handle_request(
			session,
			RequestPayload::GetProperty {
				channel: "ch".into(),
				property: "/p".into(),
			},
		));
		assert!(matches!(got, ResponsePayload::Value(Value::Int(1))));
	}

	#[test]
	fn reads_fall_through_to_later_backends() {
		let core = DaemonCore::with_backends(vec![
			Box::new(MemoryBackend::new(&[], &[])),
			Box::new(MemoryBackend::new(&[("ch", "/p", Value::Int(2))], &[])),
		])
		.unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		let got = payload(core.handle_request(
			session,
			RequestPayload::GetProperty {
				channel: "ch".into(),
				property: "/p".into(),
			},
		));
		assert!(matches!(got, ResponsePayload::Value(Value::Int(2))));

		// When every backend fails, the last error is reported.
		let err = core
			.handle_request(
				session,
				RequestPayload::GetProperty {
					channel: "ch".into(),
					property: "/missing".into(),
				},
			)
			.unwrap_err();
		assert!(matches!(err, Error::PropertyNotFound { .. }));
	}

	#[test]
	fn get_all_merges_with_first_seen_winning() {
		let core = DaemonCore::with_backends(vec![
			Box::new(MemoryBackend::new(
				&[("ch", "/a", Value::Int(1)), ("ch", "/b", Value::Int(1))],
				&[],
			)),
			Box::new(MemoryBackend::new(
				&[("ch", "/b", Value::Int(2)), ("ch", "/c", Value::Int(2))],
				&[],
			)),
		])
		.unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		let got = payload(core.handle_request(
			session,
			RequestPayload::GetAllProperties {
				channel: "ch".into(),
				property_base: "/".into(),
			},
		));
		let ResponsePayload::Properties(props) = got else {
			panic!("expected properties");
		};
		assert_eq!(props.get("/a"), Some(&Value::Int(1)));
		assert_eq!(props.get("/b"), Some(&Value::Int(1)));
		assert_eq!(props.get("/c"), Some(&Value::Int(2)));
	}

	#[test]
	fn a_lock_in_any_backend_denies_the_write() {
		let core = DaemonCore::with_backends(vec![
			Box::new(MemoryBackend::new(&[], &[])),
			Box::new(MemoryBackend::new(&[], &[("ch", "/p")])),
		])
		.unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		let err = core
			.handle_request(
				session,
				RequestPayload::SetProperty {
					channel: "ch".into(),
					property: "/p".into(),
					value: Value::Int(1),
				},
			)
			.unwrap_err();
		assert!(matches!(err, Error::PermissionDenied { .. }));

		// Unlocked properties write to the first backend only.
		payload(core.handle_request(
			session,
			RequestPayload::SetProperty {
				channel: "ch".into(),
				property: "/free".into(),
				value: Value::Int(7),
			},
		));
		let got = payload(core.handle_request(
			session,
			RequestPayload::GetProperty {
				channel: "ch".into(),
				property: "/free".into(),
			},
		));
		assert!(matches!(got, ResponsePayload::Value(Value::Int(7))));
	}

	#[test]
	fn reset_reaches_every_backend() {
		let core = DaemonCore::with_backends(vec![
			Box::new(MemoryBackend::new(&[("ch", "/p", Value::Int(1))], &[])),
			Box::new(MemoryBackend::new(&[("ch", "/p", Value::Int(2))], &[])),
		])
		.unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		payload(core.handle_request(
			session,
			RequestPayload::ResetProperty {
				channel: "ch".into(),
				property: "/p".into(),
				recursive: false,
			},
		));

		let err = core
			.handle_request(
				session,
				RequestPayload::GetProperty {
					channel: "ch".into(),
					property: "/p".into(),
				},
			)
			.unwrap_err();
		assert!(matches!(err, Error::PropertyNotFound { .. }));
	}

	#[test]
	fn list_channels_dedups_and_sorts() {
		let core = DaemonCore::with_backends(vec![
			Box::new(MemoryBackend::new(
				&[("zeta", "/p", Value::Int(1)), ("alpha", "/p", Value::Int(1))],
				&[],
			)),
			Box::new(MemoryBackend::new(&[("alpha", "/q", Value::Int(2))], &[])),
		])
		.unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		let got = payload(core.handle_request(session, RequestPayload::ListChannels));
		let ResponsePayload::Channels(channels) = got else {
			panic!("expected channels");
		};
		assert_eq!(channels, vec!["alpha".to_string(), "zeta".to_string()]);
	}

	#[test]
	fn names_are_validated_at_the_boundary() {
		let core = DaemonCore::with_backends(vec![Box::new(MemoryBackend::new(&[], &[]))]).unwrap();
		let session = core.register_session(mpsc::unbounded_channel().0);

		assert!(matches!(
			core.handle_request(
				session,
				RequestPayload::GetProperty {
					channel: "bad channel".into(),
					property: "/p".into(),
				},
			),
			Err(Error::InvalidChannel { .. })
		));
		assert!(matches!(
			core.handle_request(
				session,
				RequestPayload::GetProperty {
					channel: "ch".into(),
					property: "no-slash".into(),
				},
			),
			Err(Error::InvalidProperty { .. })
		));
		assert!(matches!(
			core.handle_request(
				session,
				RequestPayload::ResetProperty {
					channel: "ch".into(),
					property: "/".into(),
					recursive: false,
				},
			),
			Err(Error::InvalidProperty { .. })
		));
	}

	#[tokio::test]
	async fn changes_are_emitted_to_subscribers_on_a_later_turn() {
		let core = DaemonCore::with_backends(vec![Box::new(MemoryBackend::new(&[], &[]))]).unwrap();
		core.spawn_change_pump();

		let (tx, mut rx) = mpsc::unbounded_channel();
		let subscriber = core.register_session(tx);
		payload(core.handle_request(subscriber, RequestPayload::Subscribe));

		let (quiet_tx, mut quiet_rx) = mpsc::unbounded_channel();
		let _unsubscribed = core.register_session(quiet_tx);

		payload(core.handle_request(
			subscriber,
			RequestPayload::SetProperty {
				channel: "ch".into(),
				property: "/p".into(),
				value: Value::Int(5),
			},
		));

		let frame = rx.recv().await.expect("subscriber should get the event");
		let IpcFrame::Event(Event::PropertyChanged {
			channel,
			property,
			value,
		}) = frame
		else {
			panic!("expected a PropertyChanged event");
		};
		assert_eq!(channel, "ch");
		assert_eq!(property, "/p");
		assert_eq!(value, Value::Int(5));

		// Removal events follow resets.
		payload(core.handle_request(
			subscriber,
			RequestPayload::ResetProperty {
				channel: "ch".into(),
				property: "/p".into(),
				recursive: false,
			},
		));
		let frame = rx.recv().await.expect("subscriber should get the event");
		assert!(matches!(
			frame,
			IpcFrame::Event(Event::PropertyRemoved { .. })
		));

		// Sessions that never subscribed see nothing.
		assert!(quiet_rx.try_recv().is_err());
	}
}
