//! # Sync Cursors
//!
//! One cursor per collection, persisted as a document in the
//! `_sync_metadata` collection with the collection name as its id.
//!
//! ```text
//! _sync_metadata
//! ┌──────────────────┬─────────┬───────────────────────────┐
//! │ id (collection)  │ version │ lastUpdated               │
//! ├──────────────────┼─────────┼───────────────────────────┤
//! │ products         │ 12      │ 2024-05-01T10:00:00Z      │
//! │ stock_movements  │ 40      │ 2024-05-01T10:00:03Z      │
//! └──────────────────┴─────────┴───────────────────────────┘
//! ```
//!
//! No watermark means the next pull is a full download.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::record::Record;

/// Per-collection pull position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    /// Number of successful applies recorded for the collection.
    pub version: u64,
    /// Server time of the last fully applied pull.
    pub last_updated: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// True when the next pull should request everything.
    pub fn needs_full_download(&self) -> bool {
        self.last_updated.is_none()
    }

    /// Watermark formatted for the `since` query parameter.
    pub fn since(&self) -> Option<String> {
        self.last_updated
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Records a successful apply.
    ///
    /// The version always increments. The watermark only moves forward: a
    /// server time older than what we hold leaves it where it is.
    pub fn advance(&mut self, server_time: DateTime<Utc>) {
        self.version += 1;
        match self.last_updated {
            Some(current) if current >= server_time => {}
            _ => self.last_updated = Some(server_time),
        }
    }

    /// Encodes the cursor as a metadata document.
    pub fn to_record(&self, collection: &str) -> Record {
        let last_updated = match self.since() {
            Some(ts) => Value::String(ts),
            None => Value::Null,
        };
        Record::new(collection)
            .with("version", self.version)
            .with("lastUpdated", last_updated)
    }

    /// Decodes a metadata document.
    pub fn from_record(record: &Record) -> CoreResult<Self> {
        let version = match record.get("version") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| CoreError::invalid_field("version", "expected unsigned integer"))?,
        };

        let last_updated = match record.get("lastUpdated") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(parse_timestamp(s)?),
            Some(_) => {
                return Err(CoreError::invalid_field("lastUpdated", "expected string"));
            }
        };

        Ok(SyncCursor {
            version,
            last_updated,
        })
    }
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
