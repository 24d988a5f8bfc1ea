use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size for a single frame body (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RpcError {
	#[error("transport error: {0}")]
	Io(#[from] std::io::Error),
	#[error("frame size {0} exceeds maximum {max}", max = MAX_FRAME_SIZE)]
	FrameTooLarge(usize),
	#[error("malformed message: {0}")]
	Json(#[from] serde_json::Error),
	#[error("connection closed by peer")]
	Closed,
	#[error("response id {got} does not match request id {expected}")]
	IdMismatch { expected: u64, got: u64 },
	#[error("remote error: {0}")]
	Remote(String),
}

/// A call on the wire: `method` names an entry in the server's method table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

/// Reply to the request with the same `id`. Exactly one of `result` and
/// `error` is meaningful; a `null` result decodes as `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Response {
	pub fn ok(id: u64, result: Value) -> Self {
		Self {
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn err(id: u64, message: impl Into<String>) -> Self {
		Self {
			id,
			result: None,
			error: Some(message.into()),
		}
	}
}

/// Write one message: 4-byte big-endian length, then the JSON body.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let json = serde_json::to_vec(msg)?;
	let len = json.len();
	if len > MAX_FRAME_SIZE {
		return Err(RpcError::FrameTooLarge(len));
	}

	writer.write_all(&(len as u32).to_be_bytes()).await?;
	writer.write_all(&json).await?;
	writer.flush().await?;
	Ok(())
}

/// Read one message. Returns `Ok(None)` when the peer closed the connection
/// cleanly before starting a new frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	let mut len_bytes = [0u8; 4];
	match reader.read_exact(&mut len_bytes).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	}

	let len = u32::from_be_bytes(len_bytes) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(RpcError::FrameTooLarge(len));
	}

	let mut buf = vec![0u8; len];
	reader.read_exact(&mut buf).await?;
	Ok(Some(serde_json::from_slice(&buf)?))
}
