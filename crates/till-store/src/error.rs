//! # Storage Error Types
//!
//! One error type for every backend behind [`crate::StorageAdapter`].
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Configuration   endpoint unresolved / placeholder URL   (no request)   │
//! │  Transport       server unreachable, timeout                            │
//! │  Rejected        non-2xx from the remote store                          │
//! │  Database        SQLite / sqlx failures                                 │
//! │  Io              snapshot file read/write                               │
//! │  Decode          stored document is not a valid record                  │
//! │  Unsupported     optional capability not offered by this backend       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! "Not found" is deliberately absent: reads return empty or `None`.

use thiserror::Error;
use till_core::CoreError;

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend endpoint or path is missing or detectably wrong.
    #[error("Storage misconfigured: {0}")]
    Configuration(String),

    /// Remote backend could not be reached.
    #[error("Storage transport failed: {0}")]
    Transport(String),

    /// Remote backend answered with a non-success status.
    #[error("Storage request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Database query or connection failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Filesystem error while persisting a snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored or received document failed validation.
    #[error("Invalid document: {0}")]
    Decode(#[from] CoreError),

    /// JSON encode/decode failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Optional capability not implemented by this backend.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Bulk remote save stopped part-way.
    #[error("Saved {written} of {total} records before failing: {source}")]
    PartialWrite {
        written: usize,
        total: usize,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// True for failures that may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Rejected { status, .. } => *status >= 500,
            StoreError::PartialWrite { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Database("connection pool exhausted".into()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => StoreError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => StoreError::Transport(err.to_string()),
        }
    }
}
