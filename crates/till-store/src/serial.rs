//! # Serialized Writer
//!
//! The engine's apply phase and collaborator code both write to the local
//! collections. [`SerializedStore`] wraps any backend so that every mutating
//! call passes through one async mutex; reads go straight through.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   checkout ──┐                                                          │
//! │   catalog  ──┼──► write lock ──► inner.save_* / delete_*                │
//! │   engine   ──┘                                                          │
//! │                                                                         │
//! │   anyone   ──────────────────► inner.get_*                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SerializedStore::write_batch`] holds the lock across several calls, so
//! a read-modify-write sequence (stale natural-key removal, balance
//! recompute) cannot interleave with another writer.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use till_core::Record;

use crate::adapter::{StorageAdapter, StoreStats};
use crate::error::StoreResult;

/// Single-writer wrapper over any [`StorageAdapter`].
pub struct SerializedStore {
    inner: Arc<dyn StorageAdapter>,
    write_lock: Mutex<()>,
}

/// Exclusive write access held by [`SerializedStore::write_batch`].
pub struct WriteBatch<'a> {
    inner: &'a dyn StorageAdapter,
    _guard: MutexGuard<'a, ()>,
}

impl SerializedStore {
    pub fn new(inner: Arc<dyn StorageAdapter>) -> Self {
        SerializedStore {
            inner,
            write_lock: Mutex::new(()),
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner
    }

    /// Takes the write lock until the returned batch is dropped.
    pub async fn write_batch(&self) -> WriteBatch<'_> {
        WriteBatch {
            inner: self.inner.as_ref(),
            _guard: self.write_lock.lock().await,
        }
    }
}

impl WriteBatch<'_> {
    pub async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>> {
        self.inner.get_collection(name).await
    }

    pub async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>> {
        self.inner.get_document(name, id).await
    }

    pub async fn save_document(&self, name: &str, record: Record) -> StoreResult<()> {
        self.inner.save_document(name, record).await
    }

    pub async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()> {
        self.inner.delete_document(name, id).await
    }
}

#[async_trait]
impl StorageAdapter for SerializedStore {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn connect(&self) -> StoreResult<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.disconnect().await
    }

    async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>> {
        self.inner.get_collection(name).await
    }

    async fn save_collection(&self, name: &str, records: Vec<Record>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.save_collection(name, records).await
    }

    async fn save_document(&self, name: &str, record: Record) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.save_document(name, record).await
    }

    async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>> {
        self.inner.get_document(name, id).await
    }

    async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.delete_document(name, id).await
    }

    async fn execute_raw(&self, query: &str, params: &[Value]) -> StoreResult<Vec<Value>> {
        let _guard = self.write_lock.lock().await;
        self.inner.execute_raw(query, params).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}
