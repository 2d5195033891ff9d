//! Frame codec for the settled IPC protocol.
//!
//! Frames are length-delimited postcard: a 4-byte little-endian length prefix
//! followed by the postcard encoding of an [`IpcFrame`].

use std::io::{Error as IoError, ErrorKind};

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::IpcFrame;

/// Upper bound on the encoded size of a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one frame from `input`.
pub async fn read_frame(input: &mut (impl AsyncBufRead + Unpin + Send)) -> std::io::Result<IpcFrame> {
	let mut len_bytes = [0u8; 4];
	input.read_exact(&mut len_bytes).await?;
	let len = u32::from_le_bytes(len_bytes) as usize;

	if len > MAX_FRAME_LEN {
		return Err(IoError::new(
			ErrorKind::InvalidData,
			format!("frame too large: {} bytes", len),
		));
	}

	let mut buf = vec![0u8; len];
	input.read_exact(&mut buf).await?;

	postcard::from_bytes(&buf).map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))
}

/// Writes one frame to `output` and flushes.
pub async fn write_frame(
	output: &mut (impl AsyncWrite + Unpin + Send),
	frame: &IpcFrame,
) -> std::io::Result<()> {
	let buf = postcard::to_allocvec(frame)
		.map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;

	if buf.len() > MAX_FRAME_LEN {
		return Err(IoError::new(
			ErrorKind::InvalidData,
			format!("frame too large: {} bytes", buf.len()),
		));
	}

	output.write_all(&(buf.len() as u32).to_le_bytes()).await?;
	output.write_all(&buf).await?;
	output.flush().await?;

	Ok(())
}

/// Whether an I/O error from the frame loop means the peer went away.
#[must_use]
pub fn is_disconnect(err: &IoError) -> bool {
	matches!(
		err.kind(),
		ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
	)
}

#[cfg(test)]
mod tests {
	use tokio::io::BufReader;

	use super::*;
	use crate::types::{Request, RequestId, RequestPayload};
	use crate::value::Value;

	#[tokio::test]
	async fn frame_round_trip() {
		let frame = IpcFrame::Request(Request {
			id: RequestId(7),
			payload: RequestPayload::SetProperty {
				channel: "test-channel".into(),
				property: "/test/prop".into(),
				value: Value::Array(vec![
					Value::Bool(true),
					Value::Int64(5_000_000_000),
					Value::String("test string".into()),
				]),
			},
		});

		let mut buf = Vec::new();
		write_frame(&mut buf, &frame).await.unwrap();

		let mut reader = BufReader::new(buf.as_slice());
		let decoded = read_frame(&mut reader).await.unwrap();

		let IpcFrame::Request(req) = decoded else {
			panic!("expected request frame");
		};
		assert_eq!(req.id, RequestId(7));
		let RequestPayload::SetProperty { channel, property, value } = req.payload else {
			panic!("expected SetProperty");
		};
		assert_eq!(channel, "test-channel");
		assert_eq!(property, "/test/prop");
		assert_eq!(
			value,
			Value::Array(vec![
				Value::Bool(true),
				Value::Int64(5_000_000_000),
				Value::String("test string".into()),
			])
		);
	}

	#[tokio::test]
	async fn oversized_length_prefix_is_rejected() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&(u32::MAX).to_le_bytes());
		buf.extend_from_slice(&[0u8; 16]);

		let mut reader = BufReader::new(buf.as_slice());
		let err = read_frame(&mut reader).await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::InvalidData);
	}
}
