//! Durable record and watermark storage plus the last-writer-wins write path.

pub mod codec;
pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use codec::CodecError;
pub use store::Store;

/// Namespace the game writes experience rows under.
pub const DEFAULT_NAMESPACE: &str = "zanxp";

/// A single row of a player's experience points.
///
/// The namespace is not part of the record: a [`Store`] is bound to exactly
/// one namespace and scopes every read and write to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
	/// Player name, unique within a namespace.
	pub key: String,
	pub value: i32,
	/// Seconds since the Unix epoch, set by whoever produced `value`.
	pub timestamp: f64,
}

impl Experience {
	pub fn new(key: impl Into<String>, value: i32, timestamp: f64) -> Self {
		Self {
			key: key.into(),
			value,
			timestamp,
		}
	}

	/// Reject records the merge rules cannot order.
	pub fn validate(&self) -> Result<(), StoreError> {
		if !self.timestamp.is_finite() {
			return Err(StoreError::InvalidRecord {
				key: self.key.clone(),
				reason: "timestamp is not a finite number",
			});
		}
		Ok(())
	}
}

/// What the value upsert did with an incoming record. The watermark moves
/// independently: it is raised whenever the incoming timestamp is newer
/// than it, whichever way the value went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
	/// The incoming value and timestamp are now stored.
	Applied,
	/// The stored row was as new or newer and was kept.
	Superseded,
}

impl MergeOutcome {
	pub fn as_str(&self) -> &'static str {
		match self {
			MergeOutcome::Applied => "applied",
			MergeOutcome::Superseded => "superseded",
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("storage error: {0}")]
	Storage(#[from] sqlx::Error),
	#[error("stored row could not be parsed: {0}")]
	Parse(#[from] CodecError),
	#[error("could not read seed file: {0}")]
	Io(#[from] std::io::Error),
	#[error("seed script `{path}` failed: {source}")]
	Seed {
		path: String,
		#[source]
		source: sqlx::Error,
	},
	#[error("invalid record for key `{key}`: {reason}")]
	InvalidRecord { key: String, reason: &'static str },
}

/// Persistence operations the RPC facade and the sync agent depend on.
/// Implemented by [`Store`]; tests substitute doubles.
#[async_trait]
pub trait ExperienceRepo: Send + Sync + 'static {
	/// Look up a single record. A missing key is `Ok(None)`.
	async fn get(&self, key: &str) -> Result<Option<Experience>, StoreError>;
	/// Last acknowledged server timestamp for `key`, if any update was applied.
	async fn get_server_timestamp(&self, key: &str) -> Result<Option<f64>, StoreError>;
	async fn get_all(&self) -> Result<Vec<Experience>, StoreError>;
	/// Records whose timestamp is strictly greater than `threshold`.
	async fn get_since(&self, threshold: f64) -> Result<Vec<Experience>, StoreError>;
	/// Records newer than their own watermark, or with no watermark at all.
	async fn get_changed(&self) -> Result<Vec<Experience>, StoreError>;
	/// Merge one record and advance its watermark in a single transaction.
	async fn update(&self, xp: &Experience) -> Result<MergeOutcome, StoreError>;
	/// Merge a batch in one transaction; any failure rolls back the whole batch.
	async fn update_many(&self, xps: &[Experience]) -> Result<Vec<MergeOutcome>, StoreError>;
	async fn ping(&self) -> Result<(), StoreError>;
	/// Release the underlying handle. Callers must not use the repo afterwards.
	async fn close(&self);
}
