//! # till-store: Storage Backends for Till
//!
//! The [`StorageAdapter`] contract and its backends. Collaborators (catalog,
//! checkout, reporting) and the sync engine only ever see the trait.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Arc<dyn StorageAdapter>                            │
//! │                               │                                         │
//! │                     SerializedStore (one writer)                        │
//! │                               │                                         │
//! │        ┌──────────────────────┼──────────────────────┐                  │
//! │        ▼                      ▼                      ▼                  │
//! │  KeyValueStore          SqliteStore             RemoteStore             │
//! │  JSON snapshot file     documents table         server REST API         │
//! │                         + sync_queue (outbox)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - The storage contract
//! - [`kv`] - Key-value backend
//! - [`pool`] / [`migrations`] / [`repository`] - SQLite plumbing
//! - [`sqlite`] - SQLite backend
//! - [`remote`] - Remote-proxy backend
//! - [`serial`] - Single-writer wrapper
//! - [`error`] - Storage errors

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adapter;
pub mod error;
pub mod kv;
pub mod migrations;
pub mod pool;
pub mod remote;
pub mod repository;
pub mod serial;
pub mod sqlite;

// =============================================================================
// Re-exports
// =============================================================================

pub use adapter::{StorageAdapter, StoreStats};
pub use error::{StoreError, StoreResult};
pub use kv::KeyValueStore;
pub use pool::{Database, DbConfig};
pub use remote::{RemoteConfig, RemoteStore};
pub use repository::{DocumentRepository, QueueCounts, QueueRepository};
pub use serial::{SerializedStore, WriteBatch};
pub use sqlite::SqliteStore;
