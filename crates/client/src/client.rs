//! Transport client for the settled daemon.
//!
//! A [`Client`] wraps one socket connection: a background task reads frames,
//! routes responses to their callers and republishes daemon events to every
//! interested cache. Handles are cheap to clone; the connection closes when
//! the last clone drops.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use settled_proto::errors::Error;
use settled_proto::protocol::{is_disconnect, read_frame, write_frame};
use settled_proto::types::{
	Event, IpcFrame, Request, RequestId, RequestPayload, Response, ResponsePayload,
};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Capacity of the daemon-event broadcast buffer.
const EVENT_BUFFER: usize = 256;

type ReplySender = oneshot::Sender<Result<ResponsePayload, Error>>;

struct ClientInner {
	pending: Mutex<HashMap<RequestId, ReplySender>>,
	next_id: AtomicU64,
	writer: tokio::sync::Mutex<OwnedWriteHalf>,
	events: broadcast::Sender<Event>,
}

/// Handle to a daemon connection.
#[derive(Clone)]
pub struct Client {
	inner: Arc<ClientInner>,
}

/// A request in flight; await [`PendingCall::reply`] or drop to ignore.
pub(crate) struct PendingCall {
	pub(crate) id: RequestId,
	rx: oneshot::Receiver<Result<ResponsePayload, Error>>,
}

impl PendingCall {
	/// The daemon's reply, or `None` when the call was cancelled.
	pub(crate) async fn reply(self) -> Option<Result<ResponsePayload, Error>> {
		self.rx.await.ok()
	}
}

impl Client {
	/// Connects to the daemon and subscribes to change events.
	pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, Error> {
		let stream = UnixStream::connect(socket_path.as_ref())
			.await
			.map_err(|e| {
				Error::internal(format!("failed to connect to the settled daemon: {e}"))
			})?;
		let client = Self::new(stream);
		client.subscribe().await?;
		Ok(client)
	}

	/// Wraps an established connection.
	///
	/// Does not subscribe to change events; callers that want them must
	/// issue [`Client::subscribe`]. Must run inside a tokio runtime.
	#[must_use]
	pub fn new(stream: UnixStream) -> Self {
		let (reader, writer) = stream.into_split();
		let (events, _) = broadcast::channel(EVENT_BUFFER);

		let inner = Arc::new(ClientInner {
			pending: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(1),
			writer: tokio::sync::Mutex::new(writer),
			events,
		});

		// The reader holds only a weak handle so dropping the last Client
		// clone tears the connection down.
		let weak: Weak<ClientInner> = Arc::downgrade(&inner);
		tokio::spawn(async move {
			let mut reader = BufReader::new(reader);
			loop {
				let frame = match read_frame(&mut reader).await {
					Ok(frame) => frame,
					Err(e) => {
						if !is_disconnect(&e) {
							warn!(error = %e, "daemon connection error");
						}
						break;
					}
				};
				let Some(inner) = weak.upgrade() else {
					break;
				};
				inner.dispatch(frame);
			}

			if let Some(inner) = weak.upgrade() {
				inner.drain_pending();
			}
			debug!("daemon connection closed");
		});

		Self { inner }
	}

	/// Asks the daemon to deliver change events on this connection.
	pub async fn subscribe(&self) -> Result<(), Error> {
		match self.call(RequestPayload::Subscribe).await? {
			ResponsePayload::Subscribed => Ok(()),
			other => Err(Error::internal(format!(
				"unexpected response to Subscribe: {other:?}"
			))),
		}
	}

	/// Issues a request and waits for the daemon's reply.
	pub async fn call(&self, payload: RequestPayload) -> Result<ResponsePayload, Error> {
		let pending = self.begin_call(payload).await?;
		pending
			.reply()
			.await
			.unwrap_or_else(|| Err(Error::internal("daemon connection closed")))
	}

	/// Issues a request without waiting, returning a handle to the reply.
	pub(crate) async fn begin_call(&self, payload: RequestPayload) -> Result<PendingCall, Error> {
		let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.inner.pending.lock().unwrap().insert(id, tx);

		let frame = IpcFrame::Request(Request { id, payload });
		let result = {
			let mut writer = self.inner.writer.lock().await;
			write_frame(&mut *writer, &frame).await
		};

		if let Err(e) = result {
			self.inner.pending.lock().unwrap().remove(&id);
			return Err(Error::internal(format!("failed to send request: {e}")));
		}

		Ok(PendingCall { id, rx })
	}

	/// Forgets an outstanding call; its eventual reply is dropped.
	pub(crate) fn cancel(&self, id: RequestId) {
		self.inner.pending.lock().unwrap().remove(&id);
	}

	/// A fresh subscription to daemon change events.
	#[must_use]
	pub fn events(&self) -> broadcast::Receiver<Event> {
		self.inner.events.subscribe()
	}
}

impl ClientInner {
	fn dispatch(&self, frame: IpcFrame) {
		match frame {
			IpcFrame::Response(response) => {
				let sender = self.pending.lock().unwrap().remove(&response.request_id);
				if let Some(sender) = sender {
					let _ = sender.send(split_response(response));
				}
			}
			IpcFrame::Event(event) => {
				// No receivers is fine; nobody is watching this channel.
				let _ = self.events.send(event);
			}
			IpcFrame::Request(_) => {
				warn!("ignoring request frame from daemon");
			}
		}
	}

	fn drain_pending(&self) {
		let pending: Vec<ReplySender> = {
			let mut map = self.pending.lock().unwrap();
			map.drain().map(|(_, tx)| tx).collect()
		};
		for tx in pending {
			let _ = tx.send(Err(Error::internal("daemon connection closed")));
		}
	}
}

fn split_response(response: Response) -> Result<ResponsePayload, Error> {
	match (response.payload, response.error) {
		(_, Some(error)) => Err(error),
		(Some(payload), None) => Ok(payload),
		(None, None) => Err(Error::internal("malformed response frame")),
	}
}
