//! Text codec for the `Zandronum` and `Sync` tables.
//!
//! The game stores every column as text. Values are parsed and validated
//! here, once, on the way out of SQLite and formatted here on the way in, so
//! the merge and query code only ever sees typed numbers.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, ValueRef};
use thiserror::Error;

/// Failure to turn a stored column into a typed value.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
	#[error("column `{column}` is NULL")]
	Missing { column: &'static str },
	#[error("column `{column}` holds `{raw}`, which is not a valid {expected}")]
	Malformed {
		column: &'static str,
		raw: String,
		expected: &'static str,
	},
	#[error("column `{column}` holds non-finite timestamp `{raw}`")]
	NonFinite { column: &'static str, raw: String },
}

/// Format an experience value for storage.
pub fn encode_value(value: i32) -> String {
	value.to_string()
}

/// Format a timestamp for storage.
///
/// `Display` for `f64` prints the shortest string that parses back to the
/// same bits, so a stored timestamp always decodes to exactly what was written.
pub fn encode_timestamp(timestamp: f64) -> String {
	timestamp.to_string()
}

pub fn decode_value(column: &'static str, raw: &str) -> Result<i32, CodecError> {
	raw.trim().parse::<i32>().map_err(|_| CodecError::Malformed {
		column,
		raw: raw.to_string(),
		expected: "32-bit integer",
	})
}

pub fn decode_timestamp(column: &'static str, raw: &str) -> Result<f64, CodecError> {
	let parsed = raw.trim().parse::<f64>().map_err(|_| CodecError::Malformed {
		column,
		raw: raw.to_string(),
		expected: "timestamp",
	})?;
	if !parsed.is_finite() {
		return Err(CodecError::NonFinite {
			column,
			raw: raw.to_string(),
		});
	}
	Ok(parsed)
}

/// Read a column as text regardless of the storage class SQLite picked for it.
///
/// Seed scripts sometimes insert bare numbers; SQLite hands those back as
/// text through `sqlite3_column_text`, which is exactly what the parser wants.
pub fn column_text(row: &SqliteRow, column: &'static str) -> Result<String, CodecError> {
	optional_column_text(row, column)?.ok_or(CodecError::Missing { column })
}

/// Like [`column_text`], but NULL is `None`. Used for the watermark side of
/// joins, where a missing row reads as NULL.
pub fn optional_column_text(
	row: &SqliteRow,
	column: &'static str,
) -> Result<Option<String>, CodecError> {
	let raw = row
		.try_get_raw(column)
		.map_err(|_| CodecError::Missing { column })?;
	if raw.is_null() {
		return Ok(None);
	}
	row.try_get_unchecked::<String, _>(column)
		.map(Some)
		.map_err(|_| CodecError::Malformed {
			column,
			raw: "<binary>".to_string(),
			expected: "UTF-8 text",
		})
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn timestamp_survives_storage_format() {
		for ts in [1459903084.82901_f64, 1460320613.0, 0.1, -3.5] {
			let text = encode_timestamp(ts);
			assert_eq!(decode_timestamp("Timestamp", &text).unwrap(), ts);
		}
		assert_eq!(encode_timestamp(1460320613.0), "1460320613");
	}

	#[test]
	fn adjacent_timestamps_stay_distinct() {
		let ts = 1400001287.145769_f64;
		let next = f64::from_bits(ts.to_bits() + 1);
		let decoded = decode_timestamp("Timestamp", &encode_timestamp(next)).unwrap();
		assert_eq!(decoded, next);
		assert!(decoded > ts);
	}

	#[test]
	fn value_parses_with_surrounding_whitespace() {
		assert_eq!(decode_value("Value", " 359450 ").unwrap(), 359450);
		assert_eq!(decode_value("Value", &encode_value(i32::MIN)).unwrap(), i32::MIN);
	}

	#[test]
	fn value_out_of_range_is_malformed() {
		let err = decode_value("Value", "4294967296").unwrap_err();
		assert!(matches!(err, CodecError::Malformed { column: "Value", .. }));
	}

	#[test]
	fn garbage_timestamp_is_malformed() {
		let err = decode_timestamp("Timestamp", "yesterday").unwrap_err();
		assert_eq!(
			err,
			CodecError::Malformed {
				column: "Timestamp",
				raw: "yesterday".to_string(),
				expected: "timestamp",
			}
		);
	}

	#[test]
	fn infinite_timestamp_is_rejected() {
		let err = decode_timestamp("ServerTimestamp", "inf").unwrap_err();
		assert!(matches!(err, CodecError::NonFinite { .. }));
	}
}
