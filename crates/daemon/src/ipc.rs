//! IPC server for client communication.
//!
//! One daemon instance per user session is enforced by socket ownership: a
//! live peer on the socket path means another daemon already holds the
//! service name and this one exits cleanly.

use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use settled_proto::protocol::{is_disconnect, read_frame, write_frame};
use settled_proto::types::{IpcFrame, Response};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::DaemonCore;

/// How often dirty channels are persisted to disk.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Start the daemon IPC server on a Unix domain socket.
///
/// Runs until `shutdown` is cancelled; backends are flushed on the way out.
/// Fails with [`ErrorKind::AddrInUse`] when another daemon owns the socket.
pub async fn serve(
	socket_path: impl AsRef<Path>,
	core: Arc<DaemonCore>,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	let path = socket_path.as_ref();

	if path.exists() {
		// A peer answering on the socket owns the service name; a dead
		// socket file is left over from an unclean shutdown.
		match UnixStream::connect(path).await {
			Ok(_) => {
				return Err(IoError::new(
					ErrorKind::AddrInUse,
					"another settled daemon already owns the socket",
				));
			}
			Err(_) => tokio::fs::remove_file(path).await?,
		}
	}

	let listener = UnixListener::bind(path)?;
	info!(path = %path.display(), "settled IPC server listening");

	core.spawn_change_pump();
	spawn_flush_timer(&core, shutdown.clone());

	loop {
		tokio::select! {
			() = shutdown.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, _addr)) => {
					tokio::spawn(handle_connection(stream, Arc::clone(&core)));
				}
				Err(e) => {
					error!(error = %e, "failed to accept connection");
				}
			}
		}
	}

	core.flush_all();
	let _ = tokio::fs::remove_file(path).await;
	Ok(())
}

fn spawn_flush_timer(core: &Arc<DaemonCore>, shutdown: CancellationToken) {
	let core = Arc::clone(core);
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(FLUSH_INTERVAL);
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = tick.tick() => core.flush_all(),
			}
		}
	});
}

/// Handle a single client connection.
pub(crate) async fn handle_connection(stream: UnixStream, core: Arc<DaemonCore>) {
	debug!("new client connection");

	let (reader, mut writer) = stream.into_split();
	let mut reader = tokio::io::BufReader::new(reader);

	// Responses and events funnel through one channel so a single task owns
	// the write half.
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<IpcFrame>();
	let session = core.register_session(tx.clone());

	let writer_task = tokio::spawn(async move {
		while let Some(frame) = rx.recv().await {
			if let Err(e) = write_frame(&mut writer, &frame).await {
				if !is_disconnect(&e) {
					error!(error = %e, "failed to write frame");
				}
				break;
			}
		}
	});

	loop {
		match read_frame(&mut reader).await {
			Ok(IpcFrame::Request(request)) => {
				let response = match core.handle_request(session, request.payload) {
					Ok(payload) => Response {
						request_id: request.id,
						payload: Some(payload),
						error: None,
					},
					Err(e) => Response {
						request_id: request.id,
						payload: None,
						error: Some(e),
					},
				};
				if tx.send(IpcFrame::Response(response)).is_err() {
					break;
				}
			}
			Ok(_) => {
				warn!("ignoring non-request frame from client");
			}
			Err(e) => {
				if !is_disconnect(&e) {
					error!(error = %e, "client connection error");
				}
				break;
			}
		}
	}

	drop(tx);
	core.unregister_session(session);
	// Clients come and go; their edits should hit the disk promptly.
	core.flush_all();
	let _ = writer_task.await;

	debug!("client connection closed");
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;

	use settled_proto::errors::Error;
	use settled_proto::types::{Event, Request, RequestId, RequestPayload, ResponsePayload};
	use settled_proto::value::Value;
	use tempfile::TempDir;
	use tokio::io::BufReader;
	use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

	use super::*;
	use crate::backend::Backend as _;
	use crate::perchannel_xml::PerchannelXmlBackend;

	/// Client half of an in-process connection.
	///
	/// Events may race responses in the frame stream, so anything skipped
	/// while waiting for a response is queued for [`TestClient::next_event`].
	struct TestClient {
		reader: BufReader<OwnedReadHalf>,
		writer: OwnedWriteHalf,
		events: VecDeque<Event>,
		next_id: u64,
	}

	impl TestClient {
		fn new(stream: UnixStream) -> Self {
			let (reader, writer) = stream.into_split();
			Self {
				reader: BufReader::new(reader),
				writer,
				events: VecDeque::new(),
				next_id: 1,
			}
		}

		async fn request(&mut self, payload: RequestPayload) -> Response {
			let id = RequestId(self.next_id);
			self.next_id += 1;

			write_frame(&mut self.writer, &IpcFrame::Request(Request { id, payload }))
				.await
				.unwrap();

			loop {
				match read_frame(&mut self.reader).await.unwrap() {
					IpcFrame::Response(resp) => {
						assert_eq!(resp.request_id, id);
						return resp;
					}
					IpcFrame::Event(event) => self.events.push_back(event),
					IpcFrame::Request(_) => panic!("daemon sent a request"),
				}
			}
		}

		async fn next_event(&mut self) -> Event {
			if let Some(event) = self.events.pop_front() {
				return event;
			}
			loop {
				match read_frame(&mut self.reader).await.unwrap() {
					IpcFrame::Event(event) => return event,
					IpcFrame::Response(_) => panic!("unexpected response"),
					IpcFrame::Request(_) => panic!("daemon sent a request"),
				}
			}
		}
	}

	async fn connect_core(dir: &TempDir) -> (TestClient, Arc<DaemonCore>) {
		let mut backend = PerchannelXmlBackend::with_roots(
			dir.path().join("user"),
			vec![dir.path().join("system")],
		);
		backend.initialize().unwrap();

		let core = DaemonCore::with_backends(vec![Box::new(backend)]).unwrap();
		core.spawn_change_pump();

		let (client, server) = UnixStream::pair().unwrap();
		tokio::spawn(handle_connection(server, Arc::clone(&core)));
		(TestClient::new(client), core)
	}

	#[tokio::test]
	async fn set_then_get_round_trip() {
		let dir = TempDir::new().unwrap();
		let (mut client, _core) = connect_core(&dir).await;

		let resp = client
			.request(RequestPayload::SetProperty {
				channel: "test-channel".into(),
				property: "/test/bool".into(),
				value: Value::Bool(true),
			})
			.await;
		assert!(matches!(resp.payload, Some(ResponsePayload::Done)));

		let resp = client
			.request(RequestPayload::GetProperty {
				channel: "test-channel".into(),
				property: "/test/bool".into(),
			})
			.await;
		assert!(matches!(
			resp.payload,
			Some(ResponsePayload::Value(Value::Bool(true)))
		));
	}

	#[tokio::test]
	async fn errors_travel_as_responses() {
		let dir = TempDir::new().unwrap();
		let (mut client, _core) = connect_core(&dir).await;

		let resp = client
			.request(RequestPayload::GetProperty {
				channel: "missing".into(),
				property: "/x".into(),
			})
			.await;
		assert!(resp.payload.is_none());
		assert!(matches!(resp.error, Some(Error::ChannelNotFound { .. })));
	}

	#[tokio::test]
	async fn subscribed_clients_receive_change_events() {
		let dir = TempDir::new().unwrap();
		let (mut client, _core) = connect_core(&dir).await;

		let resp = client.request(RequestPayload::Subscribe).await;
		assert!(matches!(resp.payload, Some(ResponsePayload::Subscribed)));

		let resp = client
			.request(RequestPayload::SetProperty {
				channel: "test-channel".into(),
				property: "/p".into(),
				value: Value::Int(3),
			})
			.await;
		assert!(matches!(resp.payload, Some(ResponsePayload::Done)));

		let Event::PropertyChanged {
			channel,
			property,
			value,
		} = client.next_event().await
		else {
			panic!("expected a PropertyChanged event");
		};
		assert_eq!(channel, "test-channel");
		assert_eq!(property, "/p");
		assert_eq!(value, Value::Int(3));
	}
}
