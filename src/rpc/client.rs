use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::dispatch::{FULL_UPDATE, PUSH, UPDATE};
use super::wire::{self, Request, Response, RpcError};
use crate::persist::Experience;

/// Client side of the sync facade. Calls on one client run one at a time.
pub struct SyncClient {
	reader: OwnedReadHalf,
	writer: OwnedWriteHalf,
	next_id: u64,
}

impl SyncClient {
	pub async fn connect(addr: &str) -> Result<Self, RpcError> {
		let stream = TcpStream::connect(addr).await?;
		stream.set_nodelay(true)?;
		debug!("connected to {}", addr);
		let (reader, writer) = stream.into_split();
		Ok(Self {
			reader,
			writer,
			next_id: 1,
		})
	}

	/// Send `params` to `method` and decode the result as `Resp`.
	pub async fn call<Req, Resp>(&mut self, method: &str, params: &Req) -> Result<Resp, RpcError>
	where
		Req: Serialize + ?Sized,
		Resp: DeserializeOwned,
	{
		let id = self.next_id;
		self.next_id += 1;

		let request = Request {
			id,
			method: method.to_string(),
			params: serde_json::to_value(params)?,
		};
		wire::write_frame(&mut self.writer, &request).await?;

		let response: Response = wire::read_frame(&mut self.reader)
			.await?
			.ok_or(RpcError::Closed)?;
		if response.id != id {
			return Err(RpcError::IdMismatch {
				expected: id,
				got: response.id,
			});
		}
		if let Some(message) = response.error {
			return Err(RpcError::Remote(message));
		}
		Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
	}

	/// Every record the remote store holds.
	pub async fn full_update(&mut self) -> Result<Vec<Experience>, RpcError> {
		self.call(FULL_UPDATE, &()).await
	}

	/// Merge `xps` remotely as one batch. `Ok(false)` means the remote rolled
	/// the batch back.
	pub async fn push(&mut self, xps: &[Experience]) -> Result<bool, RpcError> {
		self.call(PUSH, xps).await
	}

	/// Like [`SyncClient::push`], but a rolled-back batch is an error.
	pub async fn update(&mut self, xps: &[Experience]) -> Result<(), RpcError> {
		self.call(UPDATE, xps).await
	}
}
