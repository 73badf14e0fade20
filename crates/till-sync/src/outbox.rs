//! # Outbox
//!
//! Delivers queued operations from the `sync_queue` table to the sync server.
//!
//! ## Delivery Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Outbox Delivery                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    sync_queue Table                             │   │
//! │  │                                                                 │   │
//! │  │  id    │ type               │ status  │ retry_count │ error     │   │
//! │  │  ──────┼────────────────────┼─────────┼─────────────┼───────────│   │
//! │  │  t-001 │ transaction        │ PENDING │ 0           │ NULL      │   │
//! │  │  m-001 │ inventory_movement │ PENDING │ 2           │ timeout   │   │
//! │  │  x-001 │ loyalty_points     │ ERROR   │ 1           │ no pusher │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │                                         │
//! │        enqueue() ─────────────┤◄──────────── timer tick                 │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  process()   (skips if another delivery holds the guard)        │   │
//! │  │                                                                 │   │
//! │  │  1. Probe: GET /status, return early when offline               │   │
//! │  │  2. Poll:  oldest `batch_size` PENDING items                    │   │
//! │  │  3. Route: PusherRegistry[item.type] (StubPusher if unknown)    │   │
//! │  │  4. Ack:   status = SYNCED                                      │   │
//! │  │  5. Fail:  retry_count += 1, error = msg,                       │   │
//! │  │            status = ERROR if non-retryable or policy gives up   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  The engine's push step uses the same guard and waits for it.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ERROR items are never picked up again automatically;
//! [`Outbox::requeue_errored`] puts them back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use till_core::{CoreError, Operation, QueueItem, Record, StockMovement};
use till_store::{QueueCounts, QueueRepository};

use crate::client::SyncApi;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::session::SessionManager;

// =============================================================================
// Constants
// =============================================================================

/// Failed attempts before an item moves to ERROR under the default policy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Interval of the purge of old SYNCED rows.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60 * 60);

// =============================================================================
// Retry Policy
// =============================================================================

/// What happens to an item after a retryable delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Stay PENDING no matter how often delivery fails.
    Forever,
    /// Move to ERROR once this many attempts have failed.
    GiveUpAfter(u32),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::GiveUpAfter(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// True if an item that has now failed `failures` times should stop.
    pub fn gives_up(&self, failures: u32) -> bool {
        match self {
            RetryPolicy::Forever => false,
            RetryPolicy::GiveUpAfter(limit) => failures >= *limit,
        }
    }
}

// =============================================================================
// Pushers
// =============================================================================

/// Delivers queue items of one operation kind.
#[async_trait]
pub trait OperationPusher: Send + Sync {
    /// Operation kind this pusher handles.
    fn kind(&self) -> &str;

    /// Sends `items` in one request.
    ///
    /// Returns the ids the server acknowledged. Items missing from the
    /// result count as failed deliveries.
    async fn push(&self, items: &[QueueItem]) -> SyncResult<Vec<String>>;
}

/// Runs `f` with a session token, dropping the token if the server refuses it.
async fn with_token<T, F, Fut>(session: &SessionManager, f: F) -> SyncResult<T>
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = SyncResult<T>>,
{
    let token = session.ensure_session().await?;
    let result = f(token).await;
    if matches!(result, Err(SyncError::Unauthorized)) {
        session.invalidate().await?;
    }
    result
}

fn wrong_kind(item: &QueueItem, expected: &str) -> SyncError {
    SyncError::Decode(CoreError::InvalidPayload {
        kind: item.kind().to_string(),
        reason: format!("routed to the {expected} pusher"),
    })
}

/// `POST /sync/transactions`.
pub struct TransactionPusher {
    api: Arc<dyn SyncApi>,
    session: Arc<SessionManager>,
}

impl TransactionPusher {
    pub fn new(api: Arc<dyn SyncApi>, session: Arc<SessionManager>) -> Self {
        TransactionPusher { api, session }
    }
}

#[async_trait]
impl OperationPusher for TransactionPusher {
    fn kind(&self) -> &str {
        Operation::TRANSACTION
    }

    async fn push(&self, items: &[QueueItem]) -> SyncResult<Vec<String>> {
        let records = items
            .iter()
            .map(|item| match &item.operation {
                Operation::Transaction(record) => Ok(record.clone()),
                _ => Err(wrong_kind(item, Operation::TRANSACTION)),
            })
            .collect::<SyncResult<Vec<Record>>>()?;

        let ack = with_token(&self.session, |token| async move {
            self.api.push_transactions(&token, &records).await
        })
        .await?;

        debug!(
            sent = items.len(),
            added = ack.added_count,
            "Transactions acknowledged"
        );
        Ok(items.iter().map(|item| item.id.clone()).collect())
    }
}

/// `POST /sync/inventory/movements`.
///
/// Only ids echoed in `processedIds` count as delivered.
pub struct MovementPusher {
    api: Arc<dyn SyncApi>,
    session: Arc<SessionManager>,
}

impl MovementPusher {
    pub fn new(api: Arc<dyn SyncApi>, session: Arc<SessionManager>) -> Self {
        MovementPusher { api, session }
    }
}

#[async_trait]
impl OperationPusher for MovementPusher {
    fn kind(&self) -> &str {
        Operation::INVENTORY_MOVEMENT
    }

    async fn push(&self, items: &[QueueItem]) -> SyncResult<Vec<String>> {
        let movements = items
            .iter()
            .map(|item| match &item.operation {
                Operation::InventoryMovement(movement) => Ok(movement.clone()),
                _ => Err(wrong_kind(item, Operation::INVENTORY_MOVEMENT)),
            })
            .collect::<SyncResult<Vec<StockMovement>>>()?;

        let ack = with_token(&self.session, |token| async move {
            self.api.push_movements(&token, &movements).await
        })
        .await?;

        debug!(
            sent = items.len(),
            added = ack.added_count,
            processed = ack.processed_ids.len(),
            "Movements acknowledged"
        );
        Ok(ack.processed_ids)
    }
}

/// Fallback for kinds without a registered pusher.
///
/// Never delivers. The failure is non-retryable so the item lands in ERROR,
/// where it stays until requeued.
pub struct StubPusher;

#[async_trait]
impl OperationPusher for StubPusher {
    fn kind(&self) -> &str {
        "*"
    }

    async fn push(&self, items: &[QueueItem]) -> SyncResult<Vec<String>> {
        let kind = items.first().map(QueueItem::kind).unwrap_or("unknown");
        warn!(kind = %kind, count = items.len(), "No pusher for operation kind");
        Err(SyncError::UnsupportedOperation(kind.to_string()))
    }
}

/// Pushers keyed by operation kind.
#[derive(Clone)]
pub struct PusherRegistry {
    pushers: HashMap<String, Arc<dyn OperationPusher>>,
    fallback: Arc<dyn OperationPusher>,
}

impl Default for PusherRegistry {
    fn default() -> Self {
        PusherRegistry {
            pushers: HashMap::new(),
            fallback: Arc::new(StubPusher),
        }
    }
}

impl PusherRegistry {
    /// Registry with the transaction and movement pushers.
    pub fn standard(api: Arc<dyn SyncApi>, session: Arc<SessionManager>) -> Self {
        let mut registry = PusherRegistry::default();
        registry.register(Arc::new(TransactionPusher::new(api.clone(), session.clone())));
        registry.register(Arc::new(MovementPusher::new(api, session)));
        registry
    }

    /// Adds or replaces the pusher for its kind.
    pub fn register(&mut self, pusher: Arc<dyn OperationPusher>) {
        self.pushers.insert(pusher.kind().to_string(), pusher);
    }

    /// Pusher for `kind`, or the stub.
    pub fn get(&self, kind: &str) -> Arc<dyn OperationPusher> {
        self.pushers
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

// =============================================================================
// Reports
// =============================================================================

/// What one delivery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Items handed to a pusher.
    pub attempted: usize,
    /// Items now SYNCED.
    pub synced: usize,
    /// Items that failed and stay PENDING.
    pub retrying: usize,
    /// Items that failed and moved to ERROR.
    pub gave_up: usize,
    /// The pass did not run (guard held or offline).
    pub skipped: bool,
}

impl DeliveryReport {
    fn skipped() -> Self {
        DeliveryReport {
            skipped: true,
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: DeliveryReport) {
        self.attempted += other.attempted;
        self.synced += other.synced;
        self.retrying += other.retrying;
        self.gave_up += other.gave_up;
    }

    /// True if at least one item left PENDING.
    fn made_progress(&self) -> bool {
        self.synced + self.gave_up > 0
    }
}

/// A recorded delivery, plus the retryable error that cut it short.
struct Settled {
    report: DeliveryReport,
    interrupted: Option<SyncError>,
}

impl Settled {
    fn into_result(self) -> SyncResult<DeliveryReport> {
        match self.interrupted {
            Some(e) => Err(e),
            None => Ok(self.report),
        }
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// Tunables for [`Outbox`].
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    /// Items per `process()` call.
    pub batch_size: u32,
    /// Transactions per request in the engine's push step.
    pub push_batch_size: u32,
    pub interval: Duration,
    pub policy: RetryPolicy,
    pub purge_synced_after_days: u32,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        OutboxOptions {
            batch_size: 5,
            push_batch_size: 50,
            interval: Duration::from_secs(15),
            policy: RetryPolicy::default(),
            purge_synced_after_days: 7,
        }
    }
}

impl OutboxOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        OutboxOptions {
            batch_size: config.outbox.batch_size,
            push_batch_size: config.sync.push_batch_size,
            interval: config.outbox.interval(),
            policy: config.outbox.retry_policy(),
            purge_synced_after_days: config.outbox.purge_synced_after_days,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_push_batch_size(mut self, push_batch_size: u32) -> Self {
        self.push_batch_size = push_batch_size;
        self
    }
}

/// Durable outbound queue plus its delivery loop.
pub struct Outbox {
    queue: QueueRepository,
    pushers: PusherRegistry,
    api: Arc<dyn SyncApi>,
    options: OutboxOptions,
    /// Held by whoever is delivering right now.
    delivery: Mutex<()>,
}

impl Outbox {
    pub fn new(
        queue: QueueRepository,
        pushers: PusherRegistry,
        api: Arc<dyn SyncApi>,
        options: OutboxOptions,
    ) -> Self {
        Outbox {
            queue,
            pushers,
            api,
            options,
            delivery: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &QueueRepository {
        &self.queue
    }

    /// Persists `operation` as PENDING and starts a delivery attempt in the
    /// background.
    pub async fn enqueue(self: &Arc<Self>, operation: Operation) -> SyncResult<QueueItem> {
        let item = QueueItem::new(operation);
        self.queue.insert(&item).await?;

        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = outbox.process().await {
                debug!(error = %e, "Enqueue-triggered delivery failed");
            }
        });

        Ok(item)
    }

    /// Delivers up to `batch_size` of the oldest PENDING items, one at a time.
    ///
    /// Skips if another delivery is running or the server is unreachable.
    /// A failed item never stops the rest of the batch.
    pub async fn process(&self) -> SyncResult<DeliveryReport> {
        let Ok(_guard) = self.delivery.try_lock() else {
            debug!("Delivery already running, skipping");
            return Ok(DeliveryReport::skipped());
        };

        let items = self.queue.pending(self.options.batch_size).await?;
        if items.is_empty() {
            return Ok(DeliveryReport::default());
        }

        if let Err(e) = self.api.health().await {
            debug!(error = %e, "Server unreachable, skipping outbox delivery");
            return Ok(DeliveryReport::skipped());
        }

        let mut report = DeliveryReport::default();
        for item in &items {
            match self.deliver(item.kind(), std::slice::from_ref(item)).await {
                Ok(settled) => {
                    report.absorb(settled.report);
                    if let Some(e) = settled.interrupted {
                        warn!(id = %item.id, error = %e, "Delivery failed");
                    }
                }
                Err(e) => {
                    report.attempted += 1;
                    report.retrying += 1;
                    warn!(id = %item.id, error = %e, "Could not record delivery, will retry");
                }
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            retrying = report.retrying,
            gave_up = report.gave_up,
            "Processed outbox batch"
        );
        Ok(report)
    }

    /// Push step of a sync cycle.
    ///
    /// Sends PENDING transactions in chunks of `push_batch_size` until none
    /// remain, then every PENDING movement in one request. Waits for any
    /// running delivery first. A transport or auth failure aborts and is
    /// returned; rejected items are recorded and skipped.
    pub async fn push_pending(&self) -> SyncResult<DeliveryReport> {
        let _guard = self.delivery.lock().await;

        let mut report = DeliveryReport::default();
        loop {
            let chunk = self
                .queue
                .pending_of_kind(Operation::TRANSACTION, Some(self.options.push_batch_size))
                .await?;
            if chunk.is_empty() {
                break;
            }
            let delivered = self
                .deliver(Operation::TRANSACTION, &chunk)
                .await?
                .into_result()?;
            report.absorb(delivered);
            if !delivered.made_progress() {
                break;
            }
        }

        let movements = self
            .queue
            .pending_of_kind(Operation::INVENTORY_MOVEMENT, None)
            .await?;
        if !movements.is_empty() {
            let delivered = self
                .deliver(Operation::INVENTORY_MOVEMENT, &movements)
                .await?
                .into_result()?;
            report.absorb(delivered);
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                gave_up = report.gave_up,
                "Pushed pending operations"
            );
        }
        Ok(report)
    }

    /// Sends `items` through the pusher for `kind` and records the outcome.
    ///
    /// When a multi-item request is rejected outright, each item is retried
    /// alone so one bad item cannot sink the others. `Err` means the queue
    /// itself could not be updated.
    async fn deliver(&self, kind: &str, items: &[QueueItem]) -> SyncResult<Settled> {
        let pusher = self.pushers.get(kind);

        match pusher.push(items).await {
            Err(e) if items.len() > 1 && !e.is_retryable() => {
                warn!(
                    kind = %kind,
                    count = items.len(),
                    error = %e,
                    "Batch rejected, delivering items one by one"
                );
                let mut report = DeliveryReport::default();
                for item in items {
                    let single = std::slice::from_ref(item);
                    let outcome = pusher.push(single).await;
                    let settled = self.settle(single, outcome).await?;
                    report.absorb(settled.report);
                    if settled.interrupted.is_some() {
                        return Ok(Settled {
                            report,
                            interrupted: settled.interrupted,
                        });
                    }
                }
                Ok(Settled {
                    report,
                    interrupted: None,
                })
            }
            outcome => self.settle(items, outcome).await,
        }
    }

    /// Records a push outcome in the queue.
    ///
    /// A retryable push error is handed back in [`Settled::interrupted`]
    /// after every item has been recorded.
    async fn settle(
        &self,
        items: &[QueueItem],
        outcome: SyncResult<Vec<String>>,
    ) -> SyncResult<Settled> {
        let mut report = DeliveryReport {
            attempted: items.len(),
            ..Default::default()
        };

        match outcome {
            Ok(acked) => {
                let acked: HashSet<&str> = acked.iter().map(String::as_str).collect();
                let (delivered, missing): (Vec<&QueueItem>, Vec<&QueueItem>) =
                    items.iter().partition(|item| acked.contains(item.id.as_str()));

                let ids: Vec<String> = delivered.iter().map(|item| item.id.clone()).collect();
                self.queue.mark_synced(&ids).await?;
                report.synced = ids.len();

                for item in missing {
                    if self.fail(item, "not acknowledged by server", true).await? {
                        report.gave_up += 1;
                    } else {
                        report.retrying += 1;
                    }
                }
                Ok(Settled {
                    report,
                    interrupted: None,
                })
            }
            Err(e) => {
                let retryable = e.is_retryable();
                for item in items {
                    if self.fail(item, &e.to_string(), retryable).await? {
                        report.gave_up += 1;
                    } else {
                        report.retrying += 1;
                    }
                }
                Ok(Settled {
                    report,
                    interrupted: retryable.then_some(e),
                })
            }
        }
    }

    /// Records one failure. Returns true if the item moved to ERROR.
    async fn fail(&self, item: &QueueItem, message: &str, retryable: bool) -> SyncResult<bool> {
        let give_up = !retryable || self.options.policy.gives_up(item.retry_count + 1);
        self.queue.record_failure(&item.id, message, give_up).await?;

        if give_up {
            error!(
                id = %item.id,
                kind = %item.kind(),
                attempts = item.retry_count + 1,
                error = %message,
                "Giving up on queue item"
            );
        } else {
            debug!(id = %item.id, attempts = item.retry_count + 1, "Queue item will be retried");
        }
        Ok(give_up)
    }

    /// Moves every ERROR item back to PENDING.
    pub async fn requeue_errored(&self) -> SyncResult<u64> {
        Ok(self.queue.requeue_errored().await?)
    }

    pub async fn counts(&self) -> SyncResult<QueueCounts> {
        Ok(self.queue.counts().await?)
    }

    /// Deletes SYNCED items older than the configured retention.
    pub async fn purge(&self) -> SyncResult<u64> {
        Ok(self
            .queue
            .purge_synced_older_than(self.options.purge_synced_after_days)
            .await?)
    }

    /// Timer loop. Runs until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval = ?self.options.interval, "Outbox starting");

        let mut interval = tokio::time::interval(self.options.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.process().await {
                        error!(error = %e, "Failed to process outbox batch");
                    }
                }

                _ = housekeeping.tick() => {
                    if let Err(e) = self.purge().await {
                        warn!(error = %e, "Failed to purge synced queue items");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Outbox shutting down");
                    break;
                }
            }
        }

        info!("Outbox stopped");
    }

    /// Spawns [`Outbox::run`] and returns a handle to stop it.
    pub fn start(self: &Arc<Self>) -> OutboxHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(Arc::clone(self).run(shutdown_rx));
        OutboxHandle { shutdown_tx, task }
    }
}

/// Handle for the running outbox loop.
pub struct OutboxHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl OutboxHandle {
    /// Stops the loop and waits for it to finish.
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
    use crate::testing::FakeServer;
    use serde_json::json;
    use till_core::QueueStatus;
    use till_store::{Database, DbConfig, KeyValueStore};

    struct Fixture {
        server: Arc<FakeServer>,
        outbox: Arc<Outbox>,
        queue: QueueRepository,
    }

    async fn setup(options: OutboxOptions) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.queue();
        let server = Arc::new(FakeServer::default());
        let store = Arc::new(KeyValueStore::in_memory());
        let session = Arc::new(SessionManager::new(store, server.clone(), "term-1"));
        let pushers = PusherRegistry::standard(server.clone(), session);
        let outbox = Arc::new(Outbox::new(queue.clone(), pushers, server.clone(), options));
        Fixture {
            server,
            outbox,
            queue,
        }
    }

    fn transaction(id: &str) -> Operation {
        Operation::Transaction(Record::new(id).with("total", 1250))
    }

    async fn insert(queue: &QueueRepository, operation: Operation) -> QueueItem {
        let item = QueueItem::new(operation);
        queue.insert(&item).await.unwrap();
        item
    }

    async fn status_of(queue: &QueueRepository, id: &str) -> (QueueStatus, u32) {
        let item = queue.get(id).await.unwrap().unwrap();
        (item.status, item.retry_count)
    }

    #[test]
    fn test_retry_policy() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::GiveUpAfter(10));
        assert!(!RetryPolicy::Forever.gives_up(1_000));
        assert!(!RetryPolicy::GiveUpAfter(3).gives_up(2));
        assert!(RetryPolicy::GiveUpAfter(3).gives_up(3));
    }

    #[tokio::test]
    async fn test_process_delivers_oldest_batch() {
        let fx = setup(OutboxOptions::default().with_batch_size(2)).await;
        for id in ["t1", "t2", "t3"] {
            insert(&fx.queue, transaction(id)).await;
        }

        let report = fx.outbox.process().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(status_of(&fx.queue, "t1").await.0, QueueStatus::Synced);
        assert_eq!(status_of(&fx.queue, "t2").await.0, QueueStatus::Synced);
        assert_eq!(status_of(&fx.queue, "t3").await.0, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_item_does_not_stop_batch() {
        let fx = setup(OutboxOptions::default()).await;
        insert(&fx.queue, transaction("bad")).await;
        insert(&fx.queue, transaction("good")).await;
        fx.server.with(|s| s.reject_ids.insert("bad".into()));

        let report = fx.outbox.process().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.gave_up, 1);
        assert_eq!(status_of(&fx.queue, "bad").await, (QueueStatus::Error, 1));
        assert_eq!(status_of(&fx.queue, "good").await.0, QueueStatus::Synced);
    }

    #[tokio::test]
    async fn test_give_up_after_policy_moves_to_error() {
        let fx = setup(OutboxOptions::default().with_policy(RetryPolicy::GiveUpAfter(2))).await;
        insert(&fx.queue, Operation::InventoryMovement(StockMovement::new("P1", "W1", 1))).await;
        let id = fx.queue.pending(1).await.unwrap()[0].id.clone();
        fx.server.with(|s| s.withhold_ids.insert(id.clone()));

        fx.outbox.process().await.unwrap();
        assert_eq!(status_of(&fx.queue, &id).await, (QueueStatus::Pending, 1));

        fx.outbox.process().await.unwrap();
        assert_eq!(status_of(&fx.queue, &id).await, (QueueStatus::Error, 2));

        // ERROR items are not picked up again
        fx.server.with(|s| s.withhold_ids.clear());
        let report = fx.outbox.process().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(status_of(&fx.queue, &id).await.0, QueueStatus::Error);

        assert_eq!(fx.outbox.requeue_errored().await.unwrap(), 1);
        fx.outbox.process().await.unwrap();
        assert_eq!(status_of(&fx.queue, &id).await.0, QueueStatus::Synced);
    }

    #[tokio::test]
    async fn test_transport_give_up_counted_as_gave_up() {
        let fx = setup(OutboxOptions::default().with_policy(RetryPolicy::GiveUpAfter(2))).await;
        insert(&fx.queue, transaction("t1")).await;
        fx.server.with(|s| s.drop_pushes = true);

        let first = fx.outbox.process().await.unwrap();
        assert_eq!((first.attempted, first.retrying, first.gave_up), (1, 1, 0));
        assert_eq!(status_of(&fx.queue, "t1").await, (QueueStatus::Pending, 1));

        let second = fx.outbox.process().await.unwrap();
        assert_eq!((second.attempted, second.retrying, second.gave_up), (1, 0, 1));
        assert_eq!(status_of(&fx.queue, "t1").await, (QueueStatus::Error, 2));
    }

    #[tokio::test]
    async fn test_forever_policy_stays_pending() {
        let fx = setup(OutboxOptions::default().with_policy(RetryPolicy::Forever)).await;
        let item = insert(&fx.queue, Operation::InventoryMovement(StockMovement::new("P1", "W1", 1))).await;
        fx.server.with(|s| s.withhold_ids.insert(item.id.clone()));

        for _ in 0..12 {
            fx.outbox.process().await.unwrap();
        }
        assert_eq!(status_of(&fx.queue, &item.id).await, (QueueStatus::Pending, 12));
    }

    #[tokio::test]
    async fn test_offline_process_is_skipped_without_counting() {
        let fx = setup(OutboxOptions::default()).await;
        insert(&fx.queue, transaction("t1")).await;
        fx.server.with(|s| s.online = false);

        let report = fx.outbox.process().await.unwrap();
        assert!(report.skipped);
        assert_eq!(status_of(&fx.queue, "t1").await, (QueueStatus::Pending, 0));
    }

    #[tokio::test]
    async fn test_unknown_kind_goes_to_error() {
        let fx = setup(OutboxOptions::default()).await;
        let item = insert(
            &fx.queue,
            Operation::Other {
                kind: "loyalty_points".into(),
                payload: json!({ "customerId": "c1", "points": 5 }),
            },
        )
        .await;

        fx.outbox.process().await.unwrap();
        let stored = fx.queue.get(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Error);
        assert!(stored.error.unwrap().contains("loyalty_points"));
    }

    #[tokio::test]
    async fn test_push_pending_movements_acknowledged() {
        let fx = setup(OutboxOptions::default()).await;
        let mut ids = Vec::new();
        for product in ["a", "b", "c"] {
            let item = insert(
                &fx.queue,
                Operation::InventoryMovement(StockMovement::new(product, "W1", -1)),
            )
            .await;
            ids.push(item.id);
        }

        let report = fx.outbox.push_pending().await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(fx.server.with(|s| s.movement_pushes), 1);
        for id in &ids {
            assert_eq!(status_of(&fx.queue, id).await.0, QueueStatus::Synced);
        }

        // Nothing left for the next push
        let report = fx.outbox.push_pending().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(fx.server.with(|s| s.movement_pushes), 1);
    }

    #[tokio::test]
    async fn test_push_pending_chunks_transactions() {
        let fx = setup(OutboxOptions::default().with_push_batch_size(2)).await;
        for id in ["t1", "t2", "t3", "t4", "t5"] {
            insert(&fx.queue, transaction(id)).await;
        }

        let report = fx.outbox.push_pending().await.unwrap();
        assert_eq!(report.synced, 5);
        assert_eq!(fx.server.with(|s| s.transaction_pushes), 3);
        assert_eq!(fx.outbox.counts().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_rejected_chunk_isolates_bad_item() {
        let fx = setup(OutboxOptions::default()).await;
        for id in ["t1", "t2", "t3"] {
            insert(&fx.queue, transaction(id)).await;
        }
        fx.server.with(|s| s.reject_ids.insert("t2".into()));

        let report = fx.outbox.push_pending().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.gave_up, 1);
        assert_eq!(status_of(&fx.queue, "t2").await.0, QueueStatus::Error);
    }

    #[tokio::test]
    async fn test_push_pending_offline_aborts_and_counts() {
        let fx = setup(OutboxOptions::default()).await;
        fx.outbox.push_pending().await.unwrap();
        insert(&fx.queue, transaction("t1")).await;
        fx.server.with(|s| s.online = false);

        let err = fx.outbox.push_pending().await.unwrap_err();
        assert!(err.is_offline());
        assert_eq!(status_of(&fx.queue, "t1").await.0, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_replayed_item_not_duplicated_server_side() {
        let fx = setup(OutboxOptions::default()).await;
        insert(&fx.queue, transaction("t1")).await;
        fx.outbox.push_pending().await.unwrap();

        // Same sale queued again after a crash before the ack was stored
        insert(&fx.queue, transaction("t1")).await;
        fx.outbox.push_pending().await.unwrap();

        assert_eq!(fx.server.with(|s| s.transactions.len()), 1);
        assert_eq!(status_of(&fx.queue, "t1").await.0, QueueStatus::Synced);
    }

    #[tokio::test]
    async fn test_enqueue_triggers_delivery() {
        let fx = setup(OutboxOptions::default()).await;
        let item = fx.outbox.enqueue(transaction("t1")).await.unwrap();

        for _ in 0..50 {
            if status_of(&fx.queue, &item.id).await.0 == QueueStatus::Synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status_of(&fx.queue, &item.id).await.0, QueueStatus::Synced);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let fx = setup(OutboxOptions::default()).await;
        let handle = fx.outbox.start();
        handle.shutdown().await.unwrap();
    }
}
