//! # Sync Engine
//!
//! Periodic orchestrator: authenticate, push the outbox, pull deltas per
//! collection, apply them locally, recompute derived stock balances.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Sync Cycle                                   │
//! │                                                                         │
//! │  probe GET /status ──fail──► OFFLINE (cycle skipped)                    │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  SYNCING                                                                │
//! │    1. ensure_session()          POST /sync/auth if no usable token      │
//! │    2. outbox.push_pending()     transactions (chunked), movements       │
//! │    3. for c in pull order:      GET /sync/delta/{c}?since=cursor        │
//! │    4.    apply                  upsert / delete / natural-key swap      │
//! │    5.    stage cursor           only if every item applied              │
//! │    6.    ledger touched?        recompute those balances from ledger    │
//! │    7. persist staged cursors                                            │
//! │        │                                                                │
//! │        ├── ok ──────────────► IDLE   (last_sync_at = now)               │
//! │        └── network / auth ──► ERROR  (cursors untouched, retry on tick) │
//! │                                401 also drops the session token       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only one cycle runs at a time. A trigger that arrives mid-cycle is
//! answered with [`CycleOutcome::Skipped`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use till_core::collection::{default_natural_keys, STOCK_BALANCES, STOCK_MOVEMENTS, SYNC_METADATA};
use till_core::stock::{balance_record, ledger_balance, stock_key, touched_keys};
use till_core::{NaturalKey, NaturalKeySpec, Record, SyncCursor, SyncState, SyncStatus};
use till_store::{SerializedStore, StorageAdapter, WriteBatch};

use crate::client::SyncApi;
use crate::error::{SyncError, SyncResult};
use crate::outbox::{DeliveryReport, Outbox};
use crate::protocol::DeltaResponse;
use crate::session::SessionManager;

// =============================================================================
// Events
// =============================================================================

/// Receives engine notifications for the UI layer.
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync status change event.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a progress event after the push step.
    fn emit_progress(&self, pending: u64, synced: u64);

    /// Emits a sync error event. `message` is already user-safe.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: u64, _synced: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of applying one pulled collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub collection: String,
    pub full_download: bool,
    pub upserted: usize,
    pub deleted: usize,
    /// Local records removed because the server's record took their natural key.
    pub replaced: usize,
    /// Items that could not be applied. Any failure holds the cursor back.
    pub failed: usize,
    /// Balances recomputed from the ledger after this pull.
    pub balances_recomputed: usize,
}

impl CollectionReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// What a completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pushed: DeliveryReport,
    pub collections: Vec<CollectionReport>,
}

impl CycleReport {
    /// True when every pulled collection applied without a failed item.
    pub fn is_clean(&self) -> bool {
        self.collections.iter().all(CollectionReport::is_clean)
    }
}

/// How a cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was already running.
    Skipped,
    /// The connectivity probe failed.
    Offline,
    Failed(SyncError),
}

/// Resets the running flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Pull/push orchestrator for one terminal.
pub struct SyncEngine {
    store: Arc<SerializedStore>,
    api: Arc<dyn SyncApi>,
    session: Arc<SessionManager>,
    outbox: Arc<Outbox>,
    /// Pull order.
    collections: Vec<String>,
    natural_keys: Vec<NaturalKeySpec>,
    emitter: Arc<dyn SyncEventEmitter>,
    running: AtomicBool,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<SerializedStore>,
        api: Arc<dyn SyncApi>,
        session: Arc<SessionManager>,
        outbox: Arc<Outbox>,
        collections: Vec<String>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        SyncEngine {
            store,
            api,
            session,
            outbox,
            collections,
            natural_keys: default_natural_keys(),
            emitter: Arc::new(NoOpEmitter),
            running: AtomicBool::new(false),
            status_tx,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_natural_keys(mut self, natural_keys: Vec<NaturalKeySpec>) -> Self {
        self.natural_keys = natural_keys;
        self
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Latest published status.
    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Receiver that sees every status transition.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Forces OFFLINE, or leaves it. The next successful probe also leaves it.
    pub async fn set_online(&self, online: bool) {
        let offline = self.status().state == SyncState::Offline;
        if !online && !offline {
            info!("Marked offline");
            self.publish(SyncState::Offline, Some("Server unreachable".into()), false)
                .await;
        } else if online && offline {
            self.publish(SyncState::Idle, None, false).await;
        }
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Runs one full cycle unless one is already running.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync cycle already running, skipping");
            return CycleOutcome::Skipped;
        }
        let _running = RunningGuard(&self.running);

        if let Err(e) = self.api.health().await {
            if self.status().state != SyncState::Offline {
                info!(error = %e, "Server unreachable, going offline");
            }
            self.publish(SyncState::Offline, Some(e.user_message().into()), false)
                .await;
            return CycleOutcome::Offline;
        }

        self.publish(SyncState::Syncing, None, false).await;

        match self.cycle().await {
            Ok(report) => {
                let clean = report.is_clean();
                let message = (!clean).then(|| "Some records could not be applied".to_string());
                self.publish(SyncState::Idle, message, clean).await;
                info!(
                    pushed = report.pushed.synced,
                    collections = report.collections.len(),
                    clean,
                    "Sync cycle completed"
                );
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                if e.is_auth_error() {
                    if let Err(inner) = self.session.invalidate().await {
                        warn!(error = %inner, "Failed to drop rejected session");
                    }
                }

                let state = if e.is_offline() {
                    SyncState::Offline
                } else {
                    SyncState::Error
                };
                error!(error = %e, "Sync cycle aborted");
                self.emitter.emit_error(e.user_message(), e.is_retryable());
                self.publish(state, Some(e.user_message().into()), false).await;
                CycleOutcome::Failed(e)
            }
        }
    }

    async fn cycle(&self) -> SyncResult<CycleReport> {
        let token = self.session.ensure_session().await?;

        let pushed = self.outbox.push_pending().await?;
        let counts = self.outbox.counts().await?;
        self.emitter.emit_progress(counts.pending, counts.synced);

        let mut report = CycleReport {
            pushed,
            collections: Vec::with_capacity(self.collections.len()),
        };
        let mut staged: Vec<(String, SyncCursor)> = Vec::new();

        for collection in &self.collections {
            let mut cursor = self.load_cursor(collection).await?;
            let since = cursor.since();

            debug!(collection = %collection, since = ?since, "Pulling");
            let delta = self
                .api
                .pull_delta(&token, collection, since.as_deref())
                .await?;

            let collection_report = self.apply(collection, &delta).await?;
            if collection_report.is_clean() {
                cursor.advance(delta.server_time);
                staged.push((collection.clone(), cursor));
            } else {
                warn!(
                    collection = %collection,
                    failed = collection_report.failed,
                    "Holding cursor back after failed items"
                );
            }
            report.collections.push(collection_report);
        }

        for (collection, cursor) in staged {
            self.store
                .save_document(SYNC_METADATA, cursor.to_record(&collection))
                .await?;
        }

        Ok(report)
    }

    /// Stored cursor for a collection. A missing or unreadable cursor means
    /// a full download.
    async fn load_cursor(&self, collection: &str) -> SyncResult<SyncCursor> {
        let Some(doc) = self.store.get_document(SYNC_METADATA, collection).await? else {
            return Ok(SyncCursor::default());
        };
        match SyncCursor::from_record(&doc) {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                warn!(
                    collection = %collection,
                    error = %e,
                    "Unreadable cursor, doing full download"
                );
                Ok(SyncCursor::default())
            }
        }
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Applies one pulled batch.
    ///
    /// Items with a deletion marker are removed. Everything else is upserted;
    /// for collections with a natural key, a local record with another id
    /// holding the same key is deleted first. A failed or undecodable item is
    /// logged and skipped.
    async fn apply(&self, collection: &str, delta: &DeltaResponse) -> SyncResult<CollectionReport> {
        let mut report = CollectionReport {
            collection: collection.to_string(),
            full_download: delta.is_full_download,
            ..Default::default()
        };
        if delta.items.is_empty() {
            return Ok(report);
        }

        let mut items = Vec::with_capacity(delta.items.len());
        for (index, decoded) in delta.records().into_iter().enumerate() {
            match decoded {
                Ok(record) => items.push(record),
                Err(e) => {
                    warn!(
                        collection = %collection,
                        index,
                        error = %e,
                        "Skipping undecodable item"
                    );
                    report.failed += 1;
                }
            }
        }

        let spec = self
            .natural_keys
            .iter()
            .find(|spec| spec.collection == collection);
        let is_ledger = collection == STOCK_MOVEMENTS;
        let mut touched = if is_ledger {
            touched_keys(&items)
        } else {
            BTreeSet::new()
        };

        {
            let batch = self.store.write_batch().await;

            let mut holders: BTreeMap<NaturalKey, Vec<String>> = BTreeMap::new();
            if let Some(spec) = spec {
                for record in batch.get_collection(collection).await? {
                    if let Some(key) = spec.key_of(&record) {
                        holders.entry(key).or_default().push(record.id().to_string());
                    }
                }
            }

            for item in &items {
                let id = item.id();
                if item.is_deleted() {
                    if is_ledger && stock_key(item).is_none() {
                        // The balance key lives only on the local copy
                        match batch.get_document(collection, id).await {
                            Ok(local) => touched.extend(local.as_ref().and_then(stock_key)),
                            Err(e) => {
                                warn!(
                                    collection = %collection,
                                    id = %id,
                                    error = %e,
                                    "Failed to read ledger entry, keeping it until next pull"
                                );
                                report.failed += 1;
                                continue;
                            }
                        }
                    }
                    match batch.delete_document(collection, id).await {
                        Ok(()) => {
                            report.deleted += 1;
                            for ids in holders.values_mut() {
                                ids.retain(|held| held != id);
                            }
                        }
                        Err(e) => {
                            warn!(
                                collection = %collection,
                                id = %id,
                                error = %e,
                                "Failed to delete record"
                            );
                            report.failed += 1;
                        }
                    }
                    continue;
                }

                match Self::upsert(&batch, collection, spec, &mut holders, item).await {
                    Ok(replaced) => {
                        report.upserted += 1;
                        report.replaced += replaced;
                    }
                    Err(e) => {
                        warn!(
                            collection = %collection,
                            id = %id,
                            error = %e,
                            "Failed to apply record"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        if !touched.is_empty() {
            match self.recompute_balances(&touched).await {
                Ok(count) => report.balances_recomputed = count,
                Err(e) => {
                    warn!(error = %e, "Failed to recompute stock balances");
                    report.failed += 1;
                }
            }
        }

        info!(
            collection = %collection,
            full = delta.is_full_download,
            upserted = report.upserted,
            deleted = report.deleted,
            replaced = report.replaced,
            failed = report.failed,
            "Applied pull"
        );
        Ok(report)
    }

    /// Upserts one record, evicting other records holding its natural key.
    /// Returns how many were evicted.
    ///
    /// `holders` tracks which ids hold each key as the batch goes. A record
    /// that moves to a new key is dropped from its old one, so a later item
    /// for the old key doesn't evict it.
    async fn upsert(
        batch: &WriteBatch<'_>,
        collection: &str,
        spec: Option<&NaturalKeySpec>,
        holders: &mut BTreeMap<NaturalKey, Vec<String>>,
        item: &Record,
    ) -> SyncResult<usize> {
        let id = item.id();
        let key = spec.and_then(|spec| spec.key_of(item));
        let mut replaced = 0;

        if let Some(key) = &key {
            let stale: Vec<String> = holders
                .get(key)
                .into_iter()
                .flatten()
                .filter(|held| held.as_str() != id)
                .cloned()
                .collect();
            for stale_id in &stale {
                debug!(
                    collection = %collection,
                    stale = %stale_id,
                    id = %id,
                    "Replacing record with same natural key"
                );
                if let Err(e) = batch.delete_document(collection, stale_id).await {
                    warn!(
                        collection = %collection,
                        key = %key,
                        stale = %stale_id,
                        error = %e,
                        "Could not evict record holding natural key"
                    );
                    return Err(SyncError::DataIntegrity {
                        collection: collection.to_string(),
                        key: key.to_string(),
                    });
                }
                replaced += 1;
            }
        }

        batch.save_document(collection, item.clone()).await?;

        if spec.is_some() {
            for ids in holders.values_mut() {
                ids.retain(|held| held != id);
            }
            if let Some(key) = key {
                holders.insert(key, vec![id.to_string()]);
            }
        }
        Ok(replaced)
    }

    /// Rewrites the balance for each key as the sum of the whole ledger.
    ///
    /// An existing balance for the key keeps its id; any further balance
    /// records for the same key are deleted.
    async fn recompute_balances(&self, keys: &BTreeSet<NaturalKey>) -> SyncResult<usize> {
        let spec = NaturalKeySpec::stock_balance();
        let batch = self.store.write_batch().await;
        let ledger = batch.get_collection(STOCK_MOVEMENTS).await?;
        let balances = batch.get_collection(STOCK_BALANCES).await?;
        let now = Utc::now();

        for key in keys {
            let existing: Vec<&str> = balances
                .iter()
                .filter(|balance| spec.key_of(balance).as_ref() == Some(key))
                .map(Record::id)
                .collect();

            let id = existing
                .first()
                .map(|id| id.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let quantity = ledger_balance(&ledger, key);

            batch
                .save_document(STOCK_BALANCES, balance_record(&id, key, quantity, now))
                .await?;
            for extra in existing.iter().skip(1) {
                batch.delete_document(STOCK_BALANCES, extra).await?;
            }

            debug!(key = ?key.parts(), quantity, "Recomputed stock balance");
        }

        Ok(keys.len())
    }

    // =========================================================================
    // Status
    // =========================================================================

    async fn publish(&self, state: SyncState, message: Option<String>, completed: bool) {
        let pending_count = match self.outbox.counts().await {
            Ok(counts) => counts.pending,
            Err(e) => {
                warn!(error = %e, "Failed to count pending queue items");
                self.status().pending_count
            }
        };

        let mut status = self.status();
        status.state = state;
        status.message = message;
        status.pending_count = pending_count;
        if completed {
            status.last_sync_at = Some(Utc::now());
        }

        self.emitter.emit_status(&status);
        self.status_tx.send_replace(status);
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    /// Timer loop. Also runs a cycle whenever a trigger arrives.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!(interval = ?interval, "Sync engine starting");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }

                Some(()) = trigger_rx.recv() => {
                    debug!("Sync triggered");
                    self.run_cycle().await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync engine shutting down");
                    break;
                }
            }
        }

        info!("Sync engine stopped");
    }

    /// Spawns [`SyncEngine::run`] and returns a handle to drive it.
    pub fn start(self: &Arc<Self>, interval: Duration) -> EngineHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(Arc::clone(self).run(interval, trigger_rx, shutdown_rx));

        EngineHandle {
            engine: Arc::clone(self),
            trigger_tx,
            shutdown_tx,
            task,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for the running engine loop.
pub struct EngineHandle {
    engine: Arc<SyncEngine>,
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Requests a cycle now. Coalesces with a trigger that is already queued.
    pub fn trigger(&self) {
        if self.trigger_tx.try_send(()).is_err() {
            debug!("Sync trigger already queued");
        }
    }

    /// Switches the terminal id, drops the session and syncs right away.
    pub async fn identity_changed(&self, terminal_id: &str) -> SyncResult<()> {
        self.engine.session().reidentify(terminal_id).await?;
        self.trigger();
        Ok(())
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.engine.subscribe()
    }

    /// Stops the loop after any running cycle finishes.
    pub async fn shutdown(self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        self.task.await.map_err(|_| SyncError::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{OutboxOptions, PusherRegistry};
    use crate::testing::FakeServer;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use till_core::collection::DEFAULT_PULL_ORDER;
    use till_core::stock::{LOCATION_ID, PRODUCT_ID, QUANTITY};
    use till_core::{Operation, QueueItem, StockMovement};
    use till_store::{Database, DbConfig, KeyValueStore, QueueRepository, StoreError, StoreResult};

    /// In-memory store that refuses reads or writes of chosen ids.
    struct FlakyStore {
        inner: KeyValueStore,
        refuse_save: HashSet<String>,
        refuse_get: HashSet<String>,
        refuse_delete: HashSet<String>,
    }

    impl FlakyStore {
        fn refusing(field: fn(&mut FlakyStore) -> &mut HashSet<String>, id: &str) -> Self {
            let mut store = FlakyStore {
                inner: KeyValueStore::in_memory(),
                refuse_save: HashSet::new(),
                refuse_get: HashSet::new(),
                refuse_delete: HashSet::new(),
            };
            field(&mut store).insert(id.to_string());
            store
        }

        fn check(set: &HashSet<String>, id: &str) -> StoreResult<()> {
            if set.contains(id) {
                Err(StoreError::Database(format!("disk error on {id}")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StorageAdapter for FlakyStore {
        fn backend_name(&self) -> &'static str {
            "flaky"
        }

        async fn connect(&self) -> StoreResult<()> {
            self.inner.connect().await
        }

        async fn disconnect(&self) -> StoreResult<()> {
            self.inner.disconnect().await
        }

        async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>> {
            self.inner.get_collection(name).await
        }

        async fn save_collection(&self, name: &str, records: Vec<Record>) -> StoreResult<()> {
            self.inner.save_collection(name, records).await
        }

        async fn save_document(&self, name: &str, record: Record) -> StoreResult<()> {
            Self::check(&self.refuse_save, record.id())?;
            self.inner.save_document(name, record).await
        }

        async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>> {
            Self::check(&self.refuse_get, id)?;
            self.inner.get_document(name, id).await
        }

        async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()> {
            Self::check(&self.refuse_delete, id)?;
            self.inner.delete_document(name, id).await
        }
    }

    struct Fixture {
        server: Arc<FakeServer>,
        store: Arc<SerializedStore>,
        queue: QueueRepository,
        engine: Arc<SyncEngine>,
    }

    async fn setup() -> Fixture {
        setup_with(Arc::new(KeyValueStore::in_memory())).await
    }

    async fn setup_with(adapter: Arc<dyn StorageAdapter>) -> Fixture {
        let server = Arc::new(FakeServer::default());
        let store = Arc::new(SerializedStore::new(adapter));
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.queue();

        let session = Arc::new(SessionManager::new(store.clone(), server.clone(), "term-1"));
        let outbox = Arc::new(Outbox::new(
            queue.clone(),
            PusherRegistry::standard(server.clone(), session.clone()),
            server.clone(),
            OutboxOptions::default(),
        ));
        let collections = DEFAULT_PULL_ORDER.iter().map(|c| c.to_string()).collect();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            server.clone(),
            session,
            outbox,
            collections,
        ));

        Fixture {
            server,
            store,
            queue,
            engine,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn ledger(id: &str, product: &str, location: &str, quantity: i64) -> Record {
        Record::new(id)
            .with(PRODUCT_ID, product)
            .with(LOCATION_ID, location)
            .with(QUANTITY, quantity)
    }

    async fn cursor(store: &SerializedStore, collection: &str) -> Option<SyncCursor> {
        store
            .get_document(SYNC_METADATA, collection)
            .await
            .unwrap()
            .map(|doc| SyncCursor::from_record(&doc).unwrap())
    }

    async fn balance_of(store: &SerializedStore, product: &str, location: &str) -> Vec<Record> {
        store
            .get_collection(STOCK_BALANCES)
            .await
            .unwrap()
            .into_iter()
            .filter(|b| b.get_str(PRODUCT_ID) == Some(product) && b.get_str(LOCATION_ID) == Some(location))
            .collect()
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected completed cycle, got {other:?}"),
        }
    }

    fn collection_report<'a>(report: &'a CycleReport, collection: &str) -> &'a CollectionReport {
        report
            .collections
            .iter()
            .find(|c| c.collection == collection)
            .unwrap()
    }

    async fn ids_of(store: &SerializedStore, collection: &str) -> Vec<String> {
        let mut ids: Vec<String> = store
            .get_collection(collection)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_first_cycle_full_download() {
        let fx = setup().await;
        fx.server.with(|s| {
            s.collections.insert(
                "products".into(),
                vec![Record::new("p1").with("name", "Tea"), Record::new("p2").with("name", "Milk")],
            );
            s.collections
                .insert("categories".into(), vec![Record::new("c1").with("name", "Drinks")]);
        });

        let report = completed(fx.engine.run_cycle().await);
        assert!(report.is_clean());
        assert!(report.collections.iter().all(|c| c.full_download));

        assert_eq!(fx.store.get_collection("products").await.unwrap().len(), 2);
        assert_eq!(fx.store.get_collection("categories").await.unwrap().len(), 1);

        let products = cursor(&fx.store, "products").await.unwrap();
        assert_eq!(products.version, 1);
        assert_eq!(products.last_updated, Some(at(10)));

        let status = fx.engine.status();
        assert_eq!(status.state, SyncState::Idle);
        assert!(status.last_sync_at.is_some());

        // Second cycle asks for a delta
        fx.engine.run_cycle().await;
        let pulls = fx.server.with(|s| s.pulls.clone());
        assert!(pulls.contains(&("products".into(), Some("2024-05-01T10:00:00.000Z".into()))));
    }

    #[tokio::test]
    async fn test_delta_deletes_marked_records() {
        let fx = setup().await;
        fx.server.with(|s| {
            s.collections.insert(
                "products".into(),
                vec![Record::new("p1"), Record::new("p2")],
            );
            s.deltas.insert(
                "products".into(),
                vec![
                    Record::new("p1").with("deleted", true),
                    Record::new("p3").with("name", "Sugar"),
                ],
            );
        });

        fx.engine.run_cycle().await;
        completed(fx.engine.run_cycle().await);

        let ids: Vec<String> = fx
            .store
            .get_collection("products")
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn test_full_download_replaces_natural_key_holder() {
        let fx = setup().await;
        fx.store
            .save_document(STOCK_BALANCES, ledger("local-b", "P1", "W1", 4))
            .await
            .unwrap();
        fx.server.with(|s| {
            s.collections
                .insert(STOCK_BALANCES.into(), vec![ledger("server-b", "P1", "W1", 6)]);
        });

        let report = completed(fx.engine.run_cycle().await);
        let balances = report
            .collections
            .iter()
            .find(|c| c.collection == STOCK_BALANCES)
            .unwrap();
        assert_eq!(balances.replaced, 1);

        let rows = balance_of(&fx.store, "P1", "W1").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), "server-b");
    }

    #[tokio::test]
    async fn test_push_runs_before_pull() {
        let fx = setup().await;
        for product in ["a", "b", "c"] {
            let item = QueueItem::new(Operation::InventoryMovement(StockMovement::new(
                product, "W1", 1,
            )));
            fx.queue.insert(&item).await.unwrap();
        }

        let report = completed(fx.engine.run_cycle().await);
        assert_eq!(report.pushed.synced, 3);
        assert_eq!(fx.queue.counts().await.unwrap().synced, 3);
        assert!(fx.queue.pending(10).await.unwrap().is_empty());
        assert_eq!(fx.engine.status().pending_count, 0);
        assert_eq!(fx.server.with(|s| s.movements.len()), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_pull_aborts_without_cursor_change() {
        let fx = setup().await;
        fx.server.with(|s| {
            s.collections.insert("categories".into(), vec![Record::new("c1")]);
            s.unauthorized_on = Some(("locations".into(), 1));
        });

        match fx.engine.run_cycle().await {
            CycleOutcome::Failed(e) => assert!(e.is_auth_error()),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fx.engine.status().state, SyncState::Error);
        assert!(!fx.engine.session().has_valid_token().await);
        for collection in DEFAULT_PULL_ORDER {
            assert!(cursor(&fx.store, collection).await.is_none());
        }

        // Next tick re-authenticates and completes
        completed(fx.engine.run_cycle().await);
        assert_eq!(fx.server.with(|s| s.auth_calls), 2);
        assert_eq!(cursor(&fx.store, "categories").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_ledger_delta_recomputes_touched_balances() {
        let fx = setup().await;
        for entry in [
            ledger("m1", "P2", "W1", 10),
            ledger("m2", "P3", "W2", 5),
            ledger("m3", "P9", "W9", 7),
        ] {
            fx.store.save_document(STOCK_MOVEMENTS, entry).await.unwrap();
        }
        fx.store
            .save_document(STOCK_BALANCES, ledger("bal-p9", "P9", "W9", 999))
            .await
            .unwrap();
        fx.store
            .save_document(STOCK_BALANCES, ledger("bal-p2", "P2", "W1", 0))
            .await
            .unwrap();

        let mut ledger_cursor = SyncCursor::default();
        ledger_cursor.advance(at(9));
        fx.store
            .save_document(SYNC_METADATA, ledger_cursor.to_record(STOCK_MOVEMENTS))
            .await
            .unwrap();

        fx.server.with(|s| {
            s.deltas.insert(
                STOCK_MOVEMENTS.into(),
                vec![ledger("m4", "P2", "W1", -3), ledger("m5", "P3", "W2", 1)],
            );
        });

        let report = completed(fx.engine.run_cycle().await);
        let ledger_report = report
            .collections
            .iter()
            .find(|c| c.collection == STOCK_MOVEMENTS)
            .unwrap();
        assert!(!ledger_report.full_download);
        assert_eq!(ledger_report.balances_recomputed, 2);

        let p2 = balance_of(&fx.store, "P2", "W1").await;
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].id(), "bal-p2");
        assert_eq!(p2[0].get_i64(QUANTITY), Some(7));

        let p3 = balance_of(&fx.store, "P3", "W2").await;
        assert_eq!(p3[0].get_i64(QUANTITY), Some(6));

        let p9 = balance_of(&fx.store, "P9", "W9").await;
        assert_eq!(p9[0].get_i64(QUANTITY), Some(999));
    }

    #[tokio::test]
    async fn test_deleted_ledger_entry_recomputes_from_local_key() {
        let fx = setup().await;
        fx.store
            .save_document(STOCK_MOVEMENTS, ledger("m1", "P2", "W1", 10))
            .await
            .unwrap();
        fx.store
            .save_document(STOCK_MOVEMENTS, ledger("m2", "P2", "W1", 4))
            .await
            .unwrap();

        let mut ledger_cursor = SyncCursor::default();
        ledger_cursor.advance(at(9));
        fx.store
            .save_document(SYNC_METADATA, ledger_cursor.to_record(STOCK_MOVEMENTS))
            .await
            .unwrap();
        fx.server.with(|s| {
            s.deltas
                .insert(STOCK_MOVEMENTS.into(), vec![Record::new("m2").with("deleted", true)]);
        });

        completed(fx.engine.run_cycle().await);
        let p2 = balance_of(&fx.store, "P2", "W1").await;
        assert_eq!(p2[0].get_i64(QUANTITY), Some(10));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_back() {
        let fx = setup().await;
        completed(fx.engine.run_cycle().await);

        fx.server.with(|s| s.server_time = at(8));
        completed(fx.engine.run_cycle().await);

        let products = cursor(&fx.store, "products").await.unwrap();
        assert_eq!(products.version, 2);
        assert_eq!(products.last_updated, Some(at(10)));
    }

    #[tokio::test]
    async fn test_offline_probe_skips_cycle() {
        let fx = setup().await;
        fx.server.with(|s| s.online = false);

        assert!(matches!(fx.engine.run_cycle().await, CycleOutcome::Offline));
        assert_eq!(fx.engine.status().state, SyncState::Offline);
        assert!(fx.server.with(|s| s.pulls.is_empty()));

        fx.server.with(|s| s.online = true);
        completed(fx.engine.run_cycle().await);
        assert_eq!(fx.engine.status().state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_set_online_false_forces_offline() {
        let fx = setup().await;
        fx.engine.set_online(false).await;
        assert_eq!(fx.engine.status().state, SyncState::Offline);
        fx.engine.set_online(true).await;
        assert_eq!(fx.engine.status().state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let fx = setup().await;
        fx.engine.running.store(true, Ordering::Release);
        assert!(matches!(fx.engine.run_cycle().await, CycleOutcome::Skipped));
        fx.engine.running.store(false, Ordering::Release);
        completed(fx.engine.run_cycle().await);
    }

    #[tokio::test]
    async fn test_handle_identity_change_and_shutdown() {
        let fx = setup().await;
        let handle = fx.engine.start(Duration::from_secs(3600));
        let mut status = handle.status();

        handle.identity_changed("term-2").await.unwrap();
        assert_eq!(fx.engine.session().terminal_id().await, "term-2");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if status.borrow_and_update().last_sync_at.is_some() {
                    break;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_item_holds_only_its_cursor_back() {
        let fx = setup_with(Arc::new(FlakyStore::refusing(|s| &mut s.refuse_save, "p2"))).await;
        fx.server.with(|s| {
            s.collections.insert(
                "products".into(),
                vec![Record::new("p1"), Record::new("p2"), Record::new("p3")],
            );
            s.collections.insert("categories".into(), vec![Record::new("c1")]);
        });

        let report = completed(fx.engine.run_cycle().await);
        assert!(!report.is_clean());
        let products = collection_report(&report, "products");
        assert_eq!((products.upserted, products.failed), (2, 1));

        assert!(cursor(&fx.store, "products").await.is_none());
        assert_eq!(cursor(&fx.store, "categories").await.unwrap().version, 1);
        assert_eq!(cursor(&fx.store, "locations").await.unwrap().version, 1);
        assert!(fx.engine.status().message.is_some());

        // Held-back collection is downloaded in full again
        fx.engine.run_cycle().await;
        let pulls = fx.server.with(|s| s.pulls.clone());
        let product_pulls: Vec<_> = pulls.iter().filter(|(c, _)| c == "products").collect();
        assert_eq!(product_pulls.len(), 2);
        assert!(product_pulls.iter().all(|(_, since)| since.is_none()));
    }

    #[tokio::test]
    async fn test_undecodable_item_is_skipped_not_fatal() {
        let fx = setup().await;
        fx.server.with(|s| {
            s.collections
                .insert("products".into(), vec![Record::new("p1"), Record::new("p3")]);
            s.malformed.insert(
                "products".into(),
                vec![json!({ "id": 42 }), Value::String("oops".into())],
            );
            s.collections.insert("customers".into(), vec![Record::new("cu1")]);
        });

        let report = completed(fx.engine.run_cycle().await);
        let products = collection_report(&report, "products");
        assert_eq!((products.upserted, products.failed), (2, 2));
        assert_eq!(ids_of(&fx.store, "products").await, vec!["p1", "p3"]);
        assert!(cursor(&fx.store, "products").await.is_none());

        // Collections after it were still pulled and applied
        assert_eq!(ids_of(&fx.store, "customers").await, vec!["cu1"]);
        assert_eq!(cursor(&fx.store, "customers").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_record_moving_key_is_not_evicted() {
        let fx = setup().await;
        fx.store
            .save_document(STOCK_BALANCES, ledger("X", "P1", "W1", 1))
            .await
            .unwrap();
        fx.server.with(|s| {
            s.collections.insert(
                STOCK_BALANCES.into(),
                vec![ledger("X", "P2", "W1", 1), ledger("Y", "P1", "W1", 2)],
            );
        });

        let report = completed(fx.engine.run_cycle().await);
        assert!(report.is_clean());
        assert_eq!(collection_report(&report, STOCK_BALANCES).replaced, 0);
        assert_eq!(ids_of(&fx.store, STOCK_BALANCES).await, vec!["X", "Y"]);
        assert_eq!(balance_of(&fx.store, "P2", "W1").await[0].id(), "X");
        assert_eq!(balance_of(&fx.store, "P1", "W1").await[0].id(), "Y");
    }

    #[tokio::test]
    async fn test_failed_eviction_is_data_integrity_error() {
        let fx = setup_with(Arc::new(FlakyStore::refusing(|s| &mut s.refuse_delete, "old"))).await;
        fx.store
            .save_document(STOCK_BALANCES, ledger("old", "P1", "W1", 4))
            .await
            .unwrap();

        {
            let batch = fx.store.write_batch().await;
            let spec = NaturalKeySpec::stock_balance();
            let mut holders =
                BTreeMap::from([(NaturalKey::new(["P1", "W1"]), vec!["old".to_string()])]);
            let err = SyncEngine::upsert(
                &batch,
                STOCK_BALANCES,
                Some(&spec),
                &mut holders,
                &ledger("new", "P1", "W1", 6),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, SyncError::DataIntegrity { .. }));
        }

        fx.server.with(|s| {
            s.collections
                .insert(STOCK_BALANCES.into(), vec![ledger("new", "P1", "W1", 6)]);
        });
        let report = completed(fx.engine.run_cycle().await);
        assert_eq!(collection_report(&report, STOCK_BALANCES).failed, 1);
        assert_eq!(ids_of(&fx.store, STOCK_BALANCES).await, vec!["old"]);
        assert!(cursor(&fx.store, STOCK_BALANCES).await.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_ledger_entry_is_kept_for_next_pull() {
        let fx = setup_with(Arc::new(FlakyStore::refusing(|s| &mut s.refuse_get, "m1"))).await;
        fx.store
            .save_document(STOCK_MOVEMENTS, ledger("m1", "P1", "W1", 5))
            .await
            .unwrap();
        fx.server.with(|s| {
            s.collections
                .insert(STOCK_MOVEMENTS.into(), vec![Record::new("m1").with("deleted", true)]);
        });

        let report = completed(fx.engine.run_cycle().await);
        let ledger_report = collection_report(&report, STOCK_MOVEMENTS);
        assert_eq!((ledger_report.deleted, ledger_report.failed), (0, 1));
        assert_eq!(ids_of(&fx.store, STOCK_MOVEMENTS).await, vec!["m1"]);
        assert!(cursor(&fx.store, STOCK_MOVEMENTS).await.is_none());
    }
}
