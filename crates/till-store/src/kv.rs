//! # Key-Value Backend
//!
//! Collections held in memory, optionally persisted as one JSON snapshot
//! file. Every mutation rewrites the snapshot through a temp file and an
//! atomic rename, so a crash leaves either the old or the new file, never a
//! torn one.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  save_document("products", r)                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  write lock ──► build next collection (copy) ──► serialize snapshot     │
//! │                                                        │                │
//! │                                                        ▼                │
//! │                               tmp file ──fsync──► rename over store.json│
//! │                                                        │                │
//! │                                       ok? ──► swap copy into memory     │
//! │                                       err? ─► memory untouched          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, info};

use till_core::Record;

use crate::adapter::{StorageAdapter, StoreStats};
use crate::error::{StoreError, StoreResult};

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    collections: BTreeMap<String, Vec<Record>>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    collections: BTreeMap<&'a str, &'a [Record]>,
}

/// In-memory collections with optional JSON-file persistence.
#[derive(Debug)]
pub struct KeyValueStore {
    path: Option<PathBuf>,
    collections: RwLock<BTreeMap<String, Vec<Record>>>,
}

impl KeyValueStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        KeyValueStore {
            path: None,
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Opens (or creates) a store persisted at `path`.
    ///
    /// An existing snapshot is loaded eagerly. A snapshot that exists but
    /// cannot be parsed is an error: silently starting empty would look like
    /// data loss to the sync engine and trigger a full re-download of
    /// everything while dropping unsynced local writes.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let collections = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&contents)?;
            info!(
                path = %path.display(),
                collections = snapshot.collections.len(),
                "Loaded key-value snapshot"
            );
            snapshot.collections
        } else {
            debug!(path = %path.display(), "No snapshot yet, starting empty");
            BTreeMap::new()
        };

        Ok(KeyValueStore {
            path: Some(path),
            collections: RwLock::new(collections),
        })
    }

    /// Where the snapshot lives, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applies `change` to a copy of one collection, persists, then commits.
    async fn mutate<F>(&self, name: &str, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Vec<Record>) -> bool,
    {
        let mut guard = self.collections.write().await;
        let mut next = guard.get(name).cloned().unwrap_or_default();
        if !change(&mut next) {
            return Ok(());
        }

        if let Some(path) = &self.path {
            let mut view: BTreeMap<&str, &[Record]> = guard
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_slice()))
                .collect();
            view.insert(name, next.as_slice());
            let bytes = serde_json::to_vec(&SnapshotRef {
                version: SNAPSHOT_VERSION,
                collections: view,
            })?;
            write_atomically(path.clone(), bytes).await?;
        }

        guard.insert(name.to_string(), next);
        Ok(())
    }
}

/// Writes through a sibling temp file and renames it into place.
async fn write_atomically(path: PathBuf, bytes: Vec<u8>) -> StoreResult<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))??;
    Ok(())
}

#[async_trait]
impl StorageAdapter for KeyValueStore {
    fn backend_name(&self) -> &'static str {
        "key-value"
    }

    async fn connect(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_collection(&self, name: &str, records: Vec<Record>) -> StoreResult<()> {
        // Later duplicates of an id win, keeping the first position
        let mut deduped: Vec<Record> = Vec::with_capacity(records.len());
        for record in records {
            match deduped.iter_mut().find(|r| r.id() == record.id()) {
                Some(slot) => *slot = record,
                None => deduped.push(record),
            }
        }
        self.mutate(name, move |current| {
            *current = deduped;
            true
        })
        .await
    }

    async fn save_document(&self, name: &str, record: Record) -> StoreResult<()> {
        self.mutate(name, move |current| {
            match current.iter_mut().find(|r| r.id() == record.id()) {
                Some(slot) => *slot = record,
                None => current.push(record),
            }
            true
        })
        .await
    }

    async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .and_then(|records| records.iter().find(|r| r.id() == id).cloned()))
    }

    async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()> {
        self.mutate(name, |current| {
            let before = current.len();
            current.retain(|r| r.id() != id);
            current.len() != before
        })
        .await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let guard = self.collections.read().await;
        Ok(StoreStats {
            backend: self.backend_name().to_string(),
            collections: guard.len() as u64,
            documents: guard.values().map(|v| v.len() as u64).sum(),
        })
    }
}
