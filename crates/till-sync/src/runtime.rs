//! # Sync Runtime
//!
//! Application root: builds every component from [`SyncConfig`], owns their
//! lifetimes, and is the only thing collaborators hold on to.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncRuntime::new(config)                                               │
//! │    ├─ validate config                                                   │
//! │    ├─ open {data_dir}/till.db          (queue table, sqlite documents)  │
//! │    ├─ open storage backend             sqlite | key_value | remote      │
//! │    │    └─ wrapped in SerializedStore  (single writer)                  │
//! │    ├─ load or create terminal identity                                  │
//! │    └─ sync enabled?                                                     │
//! │         ├─ HttpSyncApi, SessionManager (restore persisted token)        │
//! │         └─ Outbox + PusherRegistry, SyncEngine                          │
//! │                                                                         │
//! │  start()                                                                │
//! │    ├─ Reconciler::run()                before the first cycle           │
//! │    ├─ SyncEngine::start()              interval + triggers              │
//! │    └─ Outbox::start()                  delivery timer                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! With `sync.offline = true` nothing talks to the server: writes and queue
//! items accumulate locally until sync is enabled again.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use till_core::{Operation, QueueItem, Record, SyncState, SyncStatus};
use till_store::{
    Database, DbConfig, KeyValueStore, QueueCounts, QueueRepository, RemoteConfig, RemoteStore,
    SerializedStore, SqliteStore, StorageAdapter,
};

use crate::client::{HttpSyncApi, SyncApi};
use crate::config::{database_path, snapshot_path, StorageBackend, SyncConfig};
use crate::engine::{CycleOutcome, EngineHandle, SyncEngine, SyncEventEmitter};
use crate::error::{SyncError, SyncResult};
use crate::outbox::{OperationPusher, Outbox, OutboxHandle, OutboxOptions, PusherRegistry};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::session::{load_or_create_identity, SessionManager};

/// Extension points supplied by the embedding application.
#[derive(Default)]
pub struct RuntimeOptions {
    extra_pushers: Vec<Arc<dyn OperationPusher>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl RuntimeOptions {
    /// Adds a pusher for an operation kind the standard registry lacks.
    pub fn with_pusher(mut self, pusher: Arc<dyn OperationPusher>) -> Self {
        self.extra_pushers.push(pusher);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }
}

/// Components that only exist while sync is enabled.
struct Online {
    engine: Arc<SyncEngine>,
    outbox: Arc<Outbox>,
}

struct Running {
    engine: EngineHandle,
    outbox: OutboxHandle,
}

/// Owns storage, queue, session, outbox and engine for one terminal.
pub struct SyncRuntime {
    config: SyncConfig,
    database: Database,
    queue: QueueRepository,
    store: Arc<SerializedStore>,
    terminal_id: String,
    online: Option<Online>,
    running: Option<Running>,
    /// Status channel used while sync is disabled.
    idle_status: watch::Sender<SyncStatus>,
}

impl SyncRuntime {
    /// Builds the runtime from configuration.
    pub async fn new(config: SyncConfig) -> SyncResult<Self> {
        Self::with_options(config, RuntimeOptions::default()).await
    }

    pub async fn with_options(config: SyncConfig, options: RuntimeOptions) -> SyncResult<Self> {
        config.validate()?;

        let data_dir = config.data_dir()?;
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_config = DbConfig::new(database_path(&data_dir));
        let database = Database::new(db_config.clone()).await?;
        let backend = open_backend(&config, &data_dir, db_config, &database).await?;

        let api: Option<Arc<dyn SyncApi>> = if config.is_sync_enabled() {
            Some(Arc::new(HttpSyncApi::new(config.server.clone())?))
        } else {
            None
        };

        info!(
            terminal = %config.terminal.name,
            backend = %config.storage.backend,
            data_dir = %data_dir.display(),
            sync = config.is_sync_enabled(),
            "Opening sync runtime"
        );
        Self::from_parts(config, database, backend, api, options).await
    }

    /// Assembles the runtime from already-open parts.
    ///
    /// `api` is ignored when the configuration disables sync.
    pub async fn from_parts(
        config: SyncConfig,
        database: Database,
        backend: Arc<dyn StorageAdapter>,
        api: Option<Arc<dyn SyncApi>>,
        options: RuntimeOptions,
    ) -> SyncResult<Self> {
        let store = Arc::new(SerializedStore::new(backend));
        let queue = database.queue();
        let terminal_id =
            load_or_create_identity(store.as_ref(), config.terminal.id.as_deref()).await?;

        let online = match api.filter(|_| config.is_sync_enabled()) {
            Some(api) => {
                let session = Arc::new(SessionManager::new(
                    store.clone(),
                    api.clone(),
                    terminal_id.clone(),
                ));
                if session.restore().await? {
                    info!("Reusing persisted session");
                }

                let mut pushers = PusherRegistry::standard(api.clone(), session.clone());
                for pusher in options.extra_pushers {
                    pushers.register(pusher);
                }

                let outbox = Arc::new(Outbox::new(
                    queue.clone(),
                    pushers,
                    api.clone(),
                    OutboxOptions::from_config(&config),
                ));

                let mut engine = SyncEngine::new(
                    store.clone(),
                    api,
                    session,
                    outbox.clone(),
                    config.sync.collections.clone(),
                );
                if let Some(emitter) = options.emitter {
                    engine = engine.with_emitter(emitter);
                }

                Some(Online {
                    engine: Arc::new(engine),
                    outbox,
                })
            }
            None => None,
        };

        let (idle_status, _) = watch::channel(SyncStatus {
            state: SyncState::Offline,
            message: Some("Sync is disabled".into()),
            ..Default::default()
        });

        Ok(SyncRuntime {
            config,
            database,
            queue,
            store,
            terminal_id,
            online,
            running: None,
            idle_status,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Storage for collaborators. Every write goes through the single writer.
    pub fn store(&self) -> Arc<dyn StorageAdapter> {
        self.store.clone()
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Display name from `[terminal] name`.
    pub fn terminal_name(&self) -> &str {
        &self.config.terminal.name
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.online.is_some()
    }

    /// Latest status snapshot.
    pub fn status(&self) -> SyncStatus {
        match &self.online {
            Some(online) => online.engine.status(),
            None => self.idle_status.borrow().clone(),
        }
    }

    /// Receiver for status transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        match &self.online {
            Some(online) => online.engine.subscribe(),
            None => self.idle_status.subscribe(),
        }
    }

    pub async fn queue_counts(&self) -> SyncResult<QueueCounts> {
        Ok(self.queue.counts().await?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Runs the reconciler over local collections.
    pub async fn reconcile(&self) -> SyncResult<ReconcileReport> {
        Reconciler::new(self.store.clone()).run().await
    }

    /// Reconciles, then starts the engine and outbox loops.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.running.is_some() {
            return Ok(());
        }

        self.reconcile().await?;

        let Some(online) = &self.online else {
            info!(
                terminal = %self.terminal_name(),
                terminal_id = %self.terminal_id,
                "Sync disabled, running offline"
            );
            return Ok(());
        };

        let engine = online.engine.start(self.config.sync.interval());
        let outbox = online.outbox.start();
        self.running = Some(Running { engine, outbox });

        info!(
            terminal = %self.terminal_name(),
            terminal_id = %self.terminal_id,
            "Sync runtime started"
        );
        Ok(())
    }

    /// Reconciles and runs a single sync cycle.
    pub async fn run_once(&self) -> SyncResult<CycleOutcome> {
        self.reconcile().await?;
        match &self.online {
            Some(online) => Ok(online.engine.run_cycle().await),
            None => Ok(CycleOutcome::Offline),
        }
    }

    /// Requests a sync cycle now.
    pub fn trigger(&self) {
        if let Some(running) = &self.running {
            running.engine.trigger();
        }
    }

    /// Switches the terminal id and syncs under the new identity.
    pub async fn identity_changed(&mut self, terminal_id: &str) -> SyncResult<()> {
        match (&self.running, &self.online) {
            (Some(running), _) => running.engine.identity_changed(terminal_id).await?,
            (None, Some(online)) => online.engine.session().reidentify(terminal_id).await?,
            (None, None) => {
                load_or_create_identity(self.store.as_ref(), Some(terminal_id)).await?;
            }
        }
        self.terminal_id = terminal_id.to_string();
        Ok(())
    }

    /// Drops the session token from memory and storage.
    pub async fn logout(&self) -> SyncResult<()> {
        match &self.online {
            Some(online) => online.engine.session().logout().await,
            None => Ok(()),
        }
    }

    /// Puts every ERROR queue item back to PENDING.
    pub async fn requeue_errored(&self) -> SyncResult<u64> {
        Ok(self.queue.requeue_errored().await?)
    }

    /// Saves a record and queues its outbound operation.
    ///
    /// The record is written before the queue item.
    pub async fn save_and_enqueue(
        &self,
        collection: &str,
        record: Record,
        operation: Operation,
    ) -> SyncResult<QueueItem> {
        self.store.save_document(collection, record).await?;

        match &self.online {
            Some(online) => online.outbox.enqueue(operation).await,
            None => {
                let item = QueueItem::new(operation);
                self.queue.insert(&item).await?;
                Ok(item)
            }
        }
    }

    /// Stops the loops and closes storage.
    pub async fn shutdown(mut self) -> SyncResult<()> {
        info!("Shutting down sync runtime");

        if let Some(running) = self.running.take() {
            if let Err(e) = running.engine.shutdown().await {
                warn!(error = %e, "Sync engine did not stop cleanly");
            }
            if let Err(e) = running.outbox.shutdown().await {
                warn!(error = %e, "Outbox did not stop cleanly");
            }
        }

        self.store.disconnect().await?;
        self.database.close().await;
        info!("Sync runtime stopped");
        Ok(())
    }
}

/// Opens the configured collection backend.
///
/// An unreachable remote backend is not fatal at startup.
async fn open_backend(
    config: &SyncConfig,
    data_dir: &Path,
    db_config: DbConfig,
    database: &Database,
) -> SyncResult<Arc<dyn StorageAdapter>> {
    let backend: Arc<dyn StorageAdapter> = match config.storage.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::from_database(db_config, database.clone())),
        StorageBackend::KeyValue => Arc::new(KeyValueStore::open(snapshot_path(data_dir))?),
        StorageBackend::Remote => {
            let url = config.remote_url().ok_or_else(|| {
                SyncError::InvalidConfig("remote storage needs storage.remote_url".into())
            })?;
            Arc::new(RemoteStore::new(RemoteConfig::new(url))?)
        }
    };

    match backend.connect().await {
        Ok(()) => Ok(backend),
        Err(e) if e.is_retryable() => {
            warn!(
                backend = %backend.backend_name(),
                error = %e,
                "Storage backend unreachable, continuing"
            );
            Ok(backend)
        }
        Err(e) => Err(e.into()),
    }
}
