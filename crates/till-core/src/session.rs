//! # Session Token
//!
//! Short-lived credential returned by `POST /sync/auth`. Unlike an
//! in-memory `Instant`, it is stamped with wall-clock time so it can be
//! persisted and still be judged correctly after a restart.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::record::Record;

/// Refresh this many seconds before the server-side expiry.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Session token held by a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub value: String,
    pub terminal_id: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl SessionToken {
    /// Creates a token issued now.
    pub fn issue(value: impl Into<String>, terminal_id: impl Into<String>, ttl_secs: u64) -> Self {
        SessionToken {
            value: value.into(),
            terminal_id: terminal_id.into(),
            issued_at: Utc::now(),
            ttl_secs,
        }
    }

    /// Absolute expiry time.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX / 1_000);
        self.issued_at + Duration::seconds(ttl)
    }

    /// True once the expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// True when inside the refresh margin (or expired).
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) >= self.expires_at()
    }

    /// True when the token can be used by `terminal_id` right now.
    pub fn is_usable_by(&self, terminal_id: &str, now: DateTime<Utc>) -> bool {
        self.terminal_id == terminal_id && !self.needs_refresh(now)
    }

    /// Encodes the token as a document under the given id.
    pub fn to_record(&self, id: &str) -> CoreResult<Record> {
        let mut record = Record::new(id);
        if let serde_json::Value::Object(fields) = serde_json::to_value(self)? {
            for (k, v) in fields {
                record.set(&k, v);
            }
        }
        Ok(record)
    }

    /// Decodes a token document.
    pub fn from_record(record: &Record) -> CoreResult<Self> {
        Ok(serde_json::from_value(record.clone().into_value())?)
    }
}
