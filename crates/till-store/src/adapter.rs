//! # Storage Adapter Contract
//!
//! The only persistence interface collaborators and the sync engine use.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       StorageAdapter                                    │
//! │                                                                         │
//! │  connect / disconnect      idempotent                                   │
//! │  get_collection(name)      → Vec<Record>     (empty if unknown)         │
//! │  save_collection(name, rs) atomic replace from the caller's view        │
//! │  save_document(name, r)    upsert by id                                 │
//! │  get_document(name, id)    → Option<Record>  (None if absent)           │
//! │  delete_document(name, id) no-op if absent                              │
//! │  execute_raw(sql, params)  optional: relational backends only           │
//! │  stats()                   optional                                     │
//! │                                                                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                 │
//! │  │KeyValueStore │   │ SqliteStore  │   │ RemoteStore  │                 │
//! │  │ (json file)  │   │ (sqlx)       │   │ (reqwest)    │                 │
//! │  └──────────────┘   └──────────────┘   └──────────────┘                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use till_core::Record;

use crate::error::{StoreError, StoreResult};

/// Backend statistics for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub backend: String,
    pub collections: u64,
    pub documents: u64,
}

/// Uniform persistence contract over pluggable backends.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name for logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Opens the backend. Calling it twice is harmless.
    async fn connect(&self) -> StoreResult<()>;

    /// Closes the backend. Calling it twice is harmless.
    async fn disconnect(&self) -> StoreResult<()>;

    /// All records of a collection, in insertion order.
    async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>>;

    /// Replaces a collection's contents.
    async fn save_collection(&self, name: &str, records: Vec<Record>) -> StoreResult<()>;

    /// Inserts or replaces one record by id.
    async fn save_document(&self, name: &str, record: Record) -> StoreResult<()>;

    /// One record by id.
    async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Removes one record by id. Absent ids are not an error.
    async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()>;

    /// Runs a raw query. Rows come back as JSON objects keyed by column name.
    async fn execute_raw(&self, _query: &str, _params: &[Value]) -> StoreResult<Vec<Value>> {
        Err(StoreError::Unsupported {
            backend: self.backend_name(),
            operation: "execute_raw",
        })
    }

    /// Backend statistics.
    async fn stats(&self) -> StoreResult<StoreStats> {
        Err(StoreError::Unsupported {
            backend: self.backend_name(),
            operation: "stats",
        })
    }
}
