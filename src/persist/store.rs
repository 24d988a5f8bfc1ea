use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use sqlx::query::Query;
use sqlx::sqlite::{
	SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, Sqlite, SqliteConnection};
use tokio::sync::Mutex;

use super::codec::{self, CodecError};
use super::{Experience, ExperienceRepo, MergeOutcome, StoreError};

const CREATE_RECORD_TABLE: &str = "CREATE TABLE IF NOT EXISTS Zandronum(Namespace text, KeyName text, Value text, Timestamp text, PRIMARY KEY (Namespace, KeyName));";

// Zandronum never touches this table. A row here records the newest server
// timestamp this node has seen for a key, so a game-side write shows up as a
// Zandronum.Timestamp greater than Sync.ServerTimestamp.
const CREATE_WATERMARK_TABLE: &str = "CREATE TABLE IF NOT EXISTS Sync(Namespace text, KeyName text, ServerTimestamp text, PRIMARY KEY (Namespace, KeyName));";

// Both timestamps for one key, NULL where absent. Always returns one row.
const SELECT_STORED_TIMESTAMPS: &str = r#"
	SELECT
		(SELECT Timestamp FROM Zandronum WHERE Namespace = ?1 AND KeyName = ?2) AS Timestamp,
		(SELECT ServerTimestamp FROM Sync WHERE Namespace = ?1 AND KeyName = ?2) AS ServerTimestamp"#;

const WRITE_RECORD: &str = r#"
	INSERT INTO Zandronum (Namespace, KeyName, Value, Timestamp)
	VALUES (?1, ?2, ?3, ?4)
	ON CONFLICT (Namespace, KeyName) DO UPDATE
	SET Value = excluded.Value, Timestamp = excluded.Timestamp"#;

const WRITE_WATERMARK: &str = r#"
	INSERT INTO Sync (Namespace, KeyName, ServerTimestamp)
	VALUES (?1, ?2, ?3)
	ON CONFLICT (Namespace, KeyName) DO UPDATE
	SET ServerTimestamp = excluded.ServerTimestamp"#;

const SELECT_ONE: &str = r#"
	SELECT KeyName, Value, Timestamp FROM Zandronum
	WHERE Namespace = ?1 AND KeyName = ?2 LIMIT 1"#;

const SELECT_WATERMARK: &str = r#"
	SELECT ServerTimestamp FROM Sync
	WHERE Namespace = ?1 AND KeyName = ?2 LIMIT 1"#;

const SELECT_ALL: &str = r#"
	SELECT KeyName, Value, Timestamp FROM Zandronum
	WHERE Namespace = ?1 ORDER BY KeyName"#;

const SELECT_WITH_WATERMARKS: &str = r#"
	SELECT Z.KeyName AS KeyName, Z.Value AS Value, Z.Timestamp AS Timestamp,
		S.ServerTimestamp AS ServerTimestamp
	FROM Zandronum AS Z
	LEFT OUTER JOIN Sync AS S
		ON Z.Namespace = S.Namespace
		AND Z.KeyName = S.KeyName
	WHERE Z.Namespace = ?1
	ORDER BY Z.KeyName"#;

/// SQLite-backed record and watermark store scoped to one namespace.
///
/// Timestamps are stored as text and only ever ordered after decoding, so
/// SQLite's own text-to-real conversion never decides a merge or a filter.
pub struct Store {
	pool: SqlitePool,
	namespace: String,
	// Write transactions read the stored timestamps before writing, so they
	// must not interleave.
	write_lock: Mutex<()>,
}

impl Store {
	/// Open (creating if needed) the database at `path` and make sure both
	/// tables exist. `:memory:` opens a private in-memory database.
	pub async fn open(path: &str, namespace: impl Into<String>) -> Result<Self, StoreError> {
		let in_memory = path == ":memory:";
		let options = if in_memory {
			SqliteConnectOptions::from_str("sqlite::memory:")?
		} else {
			SqliteConnectOptions::new()
				.filename(path)
				.create_if_missing(true)
		}
		.busy_timeout(Duration::from_secs(5));

		// Every connection to `:memory:` is its own database, so the pool
		// must keep exactly one connection alive for the store's lifetime.
		let pool_options = if in_memory {
			SqlitePoolOptions::new()
				.max_connections(1)
				.min_connections(1)
				.idle_timeout(None)
				.max_lifetime(None)
		} else {
			SqlitePoolOptions::new().max_connections(8)
		};

		let pool = pool_options.connect_with(options).await?;
		let store = Self {
			pool,
			namespace: namespace.into(),
			write_lock: Mutex::new(()),
		};
		store.create_schema().await?;
		debug!("opened store at {} (namespace {})", path, store.namespace);
		Ok(store)
	}

	async fn create_schema(&self) -> Result<(), StoreError> {
		self.pool.execute(CREATE_RECORD_TABLE).await?;
		self.pool.execute(CREATE_WATERMARK_TABLE).await?;
		Ok(())
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	/// Execute seed SQL scripts, in order, against the store.
	///
	/// Scripts are opaque: they may carry their own `BEGIN`/`COMMIT`, so they
	/// are run as-is on a single connection rather than inside a transaction
	/// of ours. The first failure stops the import.
	pub async fn import<P: AsRef<std::path::Path>>(&self, paths: &[P]) -> Result<(), StoreError> {
		let mut conn = self.pool.acquire().await?;
		for path in paths {
			let path = path.as_ref();
			let script = tokio::fs::read_to_string(path).await?;
			let result = (&mut *conn)
				.execute(script.as_str())
				.await
				.map_err(|source| StoreError::Seed {
					path: path.display().to_string(),
					source,
				})?;
			info!(
				"imported seed {} ({} rows affected)",
				path.display(),
				result.rows_affected()
			);
		}
		Ok(())
	}

	async fn fetch_records<'a>(
		&'a self,
		query: Query<'a, Sqlite, SqliteArguments<'a>>,
	) -> Result<Vec<Experience>, StoreError> {
		let rows = query.fetch_all(&self.pool).await?;
		let records = rows
			.iter()
			.map(decode_record)
			.collect::<Result<Vec<_>, CodecError>>()?;
		Ok(records)
	}
}

fn decode_record(row: &SqliteRow) -> Result<Experience, CodecError> {
	let key = codec::column_text(row, "KeyName")?;
	let value = codec::decode_value("Value", &codec::column_text(row, "Value")?)?;
	let timestamp = codec::decode_timestamp("Timestamp", &codec::column_text(row, "Timestamp")?)?;
	Ok(Experience {
		key,
		value,
		timestamp,
	})
}

fn decode_optional_timestamp(
	row: &SqliteRow,
	column: &'static str,
) -> Result<Option<f64>, CodecError> {
	codec::optional_column_text(row, column)?
		.map(|raw| codec::decode_timestamp(column, &raw))
		.transpose()
}

/// Merge one record on the caller's transaction so the value and the
/// watermark commit or roll back together. Each half is written only when
/// the incoming timestamp is strictly newer than what is stored.
async fn upsert(
	conn: &mut SqliteConnection,
	namespace: &str,
	xp: &Experience,
) -> Result<MergeOutcome, StoreError> {
	let stored = sqlx::query(SELECT_STORED_TIMESTAMPS)
		.bind(namespace)
		.bind(&xp.key)
		.fetch_one(&mut *conn)
		.await?;
	let record_ts = decode_optional_timestamp(&stored, "Timestamp")?;
	let watermark = decode_optional_timestamp(&stored, "ServerTimestamp")?;
	let timestamp = codec::encode_timestamp(xp.timestamp);

	let won = record_ts.is_none_or(|ts| xp.timestamp > ts);
	if won {
		sqlx::query(WRITE_RECORD)
			.bind(namespace)
			.bind(&xp.key)
			.bind(codec::encode_value(xp.value))
			.bind(&timestamp)
			.execute(&mut *conn)
			.await?;
	}

	if watermark.is_none_or(|ts| xp.timestamp > ts) {
		sqlx::query(WRITE_WATERMARK)
			.bind(namespace)
			.bind(&xp.key)
			.bind(&timestamp)
			.execute(&mut *conn)
			.await?;
	}

	Ok(if won {
		MergeOutcome::Applied
	} else {
		MergeOutcome::Superseded
	})
}

#[async_trait]
impl ExperienceRepo for Store {
	async fn get(&self, key: &str) -> Result<Option<Experience>, StoreError> {
		let row = sqlx::query(SELECT_ONE)
			.bind(&self.namespace)
			.bind(key)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.as_ref().map(decode_record).transpose()?)
	}

	async fn get_server_timestamp(&self, key: &str) -> Result<Option<f64>, StoreError> {
		let row = sqlx::query(SELECT_WATERMARK)
			.bind(&self.namespace)
			.bind(key)
			.fetch_optional(&self.pool)
			.await?;
		match row {
			Some(row) => {
				let raw = codec::column_text(&row, "ServerTimestamp")?;
				Ok(Some(codec::decode_timestamp("ServerTimestamp", &raw)?))
			}
			None => Ok(None),
		}
	}

	async fn get_all(&self) -> Result<Vec<Experience>, StoreError> {
		self.fetch_records(sqlx::query(SELECT_ALL).bind(&self.namespace))
			.await
	}

	async fn get_since(&self, threshold: f64) -> Result<Vec<Experience>, StoreError> {
		let mut records = self.get_all().await?;
		records.retain(|xp| xp.timestamp > threshold);
		Ok(records)
	}

	async fn get_changed(&self) -> Result<Vec<Experience>, StoreError> {
		let rows = sqlx::query(SELECT_WITH_WATERMARKS)
			.bind(&self.namespace)
			.fetch_all(&self.pool)
			.await?;

		let mut changed = Vec::new();
		for row in &rows {
			let xp = decode_record(row)?;
			let watermark = decode_optional_timestamp(row, "ServerTimestamp")?;
			if watermark.is_none_or(|ts| xp.timestamp > ts) {
				changed.push(xp);
			}
		}
		Ok(changed)
	}

	async fn update(&self, xp: &Experience) -> Result<MergeOutcome, StoreError> {
		xp.validate()?;

		let _guard = self.write_lock.lock().await;
		let mut tx = self.pool.begin().await?;
		let outcome = upsert(&mut *tx, &self.namespace, xp).await?;
		tx.commit().await?;

		debug!(
			"update {} value={} ts={} -> {}",
			xp.key,
			xp.value,
			xp.timestamp,
			outcome.as_str()
		);
		Ok(outcome)
	}

	async fn update_many(&self, xps: &[Experience]) -> Result<Vec<MergeOutcome>, StoreError> {
		for xp in xps {
			xp.validate()?;
		}
		if xps.is_empty() {
			return Ok(Vec::new());
		}

		// Dropping `tx` on an early return rolls the whole batch back.
		let _guard = self.write_lock.lock().await;
		let mut tx = self.pool.begin().await?;
		let mut outcomes = Vec::with_capacity(xps.len());
		for xp in xps {
			outcomes.push(upsert(&mut *tx, &self.namespace, xp).await?);
		}
		tx.commit().await?;

		debug!("update_many committed {} records", outcomes.len());
		Ok(outcomes)
	}

	async fn ping(&self) -> Result<(), StoreError> {
		sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
		Ok(())
	}

	async fn close(&self) {
		self.pool.close().await;
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	async fn memory_store() -> Store {
		Store::open(":memory:", "zanxp").await.unwrap()
	}

	#[tokio::test]
	async fn open_creates_both_tables() {
		let store = memory_store().await;
		assert!(store.get_all().await.unwrap().is_empty());
		assert!(store.get_changed().await.unwrap().is_empty());
		assert_eq!(store.get_server_timestamp("alexmax").await.unwrap(), None);
	}

	#[tokio::test]
	async fn first_update_creates_record_and_watermark() {
		let store = memory_store().await;
		let outcome = store
			.update(&Experience::new("anonymous", 5000, 1460320613.0))
			.await
			.unwrap();
		assert_eq!(outcome, MergeOutcome::Applied);

		let row = store.get("anonymous").await.unwrap().unwrap();
		assert_eq!(row, Experience::new("anonymous", 5000, 1460320613.0));
		assert_eq!(
			store.get_server_timestamp("anonymous").await.unwrap(),
			Some(1460320613.0)
		);
	}

	#[tokio::test]
	async fn equal_timestamp_keeps_existing_value() {
		let store = memory_store().await;
		store
			.update(&Experience::new("dusk", 10, 1000.5))
			.await
			.unwrap();
		let outcome = store
			.update(&Experience::new("dusk", 99, 1000.5))
			.await
			.unwrap();
		assert_eq!(outcome, MergeOutcome::Superseded);
		assert_eq!(store.get("dusk").await.unwrap().unwrap().value, 10);
	}

	#[tokio::test]
	async fn timestamps_compare_numerically_not_as_text() {
		let store = memory_store().await;
		store.update(&Experience::new("k", 1, 999.0)).await.unwrap();
		// "1000" < "999" as text; numerically it is newer.
		let outcome = store.update(&Experience::new("k", 2, 1000.0)).await.unwrap();
		assert_eq!(outcome, MergeOutcome::Applied);
		assert_eq!(store.get("k").await.unwrap().unwrap().value, 2);
	}

	#[tokio::test]
	async fn one_ulp_newer_timestamp_wins() {
		let store = memory_store().await;
		let ts = 1400001287.145769_f64;
		let next = f64::from_bits(ts.to_bits() + 1);

		store.update(&Experience::new("k", 1, ts)).await.unwrap();
		let outcome = store.update(&Experience::new("k", 2, next)).await.unwrap();
		assert_eq!(outcome, MergeOutcome::Applied);
		assert_eq!(store.get("k").await.unwrap().unwrap(), Experience::new("k", 2, next));
		assert_eq!(store.get_server_timestamp("k").await.unwrap(), Some(next));

		// And one ulp older loses, leaving the watermark alone.
		let outcome = store.update(&Experience::new("k", 3, ts)).await.unwrap();
		assert_eq!(outcome, MergeOutcome::Superseded);
		assert_eq!(store.get_server_timestamp("k").await.unwrap(), Some(next));
	}

	#[tokio::test]
	async fn get_since_excludes_a_record_at_its_own_timestamp() {
		let store = memory_store().await;
		let ts = 1400001287.145769_f64;
		let next = f64::from_bits(ts.to_bits() + 1);
		store.update(&Experience::new("k", 1, next)).await.unwrap();

		let stored = store.get("k").await.unwrap().unwrap().timestamp;
		assert!(store.get_since(stored).await.unwrap().is_empty());
		assert_eq!(store.get_since(ts).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn one_ulp_past_the_watermark_is_changed() {
		let store = memory_store().await;
		let ts = 1400001287.145769_f64;
		let next = f64::from_bits(ts.to_bits() + 1);
		store.update(&Experience::new("k", 1, ts)).await.unwrap();
		assert!(store.get_changed().await.unwrap().is_empty());

		// The game bumps the row without touching Sync.
		sqlx::query("UPDATE Zandronum SET Timestamp = ?1 WHERE KeyName = 'k'")
			.bind(codec::encode_timestamp(next))
			.execute(&store.pool)
			.await
			.unwrap();
		let changed = store.get_changed().await.unwrap();
		assert_eq!(changed, vec![Experience::new("k", 1, next)]);
	}

	#[tokio::test]
	async fn empty_key_is_a_valid_record() {
		let store = memory_store().await;
		let outcome = store.update(&Experience::new("", 3, 10.0)).await.unwrap();
		assert_eq!(outcome, MergeOutcome::Applied);
		assert_eq!(store.get("").await.unwrap().unwrap().value, 3);
	}

	#[tokio::test]
	async fn namespaces_do_not_see_each_other() {
		let store = memory_store().await;
		sqlx::query("INSERT INTO Zandronum VALUES ('other', 'alexmax', '1', '1.0')")
			.execute(&store.pool)
			.await
			.unwrap();
		assert!(store.get("alexmax").await.unwrap().is_none());
		assert!(store.get_all().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn nan_timestamp_is_rejected_before_storage() {
		let store = memory_store().await;
		let err = store
			.update(&Experience::new("k", 1, f64::NAN))
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::InvalidRecord { .. }));
		assert!(store.get("k").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn malformed_stored_value_surfaces_as_parse_error() {
		let store = memory_store().await;
		sqlx::query("INSERT INTO Zandronum VALUES ('zanxp', 'broken', 'lots', '1.0')")
			.execute(&store.pool)
			.await
			.unwrap();
		let err = store.get("broken").await.unwrap_err();
		assert!(matches!(err, StoreError::Parse(CodecError::Malformed { column: "Value", .. })));
	}
}
