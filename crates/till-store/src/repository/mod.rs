//! # Repository Module
//!
//! SQL access for the SQLite backend, one repository per table.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SqliteStore ──► DocumentRepository ──► documents                       │
//! │  Outbox      ──► QueueRepository    ──► sync_queue                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps are stored as fixed-width RFC 3339 text (microseconds, `Z`),
//! so string comparison in SQL orders them correctly.
//!
//! ## Available Repositories
//!
//! - [`DocumentRepository`] - Collection documents
//! - [`QueueRepository`] - Outbox queue

pub mod document;
pub mod queue;

pub use document::DocumentRepository;
pub use queue::{QueueCounts, QueueRepository};

use chrono::{DateTime, SecondsFormat, Utc};

/// Column form of a timestamp.
pub(crate) fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
