//! # Embedded Database
//!
//! One SQLite file per terminal holds both the document collections and the
//! outbox queue.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          till.db (SQLite)                               │
//! │                                                                         │
//! │  DbConfig::new(data_dir/till.db)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config) ── pool ── migrations/sqlite/*.sql               │
//! │       │                                                                 │
//! │       ├── documents()  → DocumentRepository  (SqliteStore)              │
//! │       ├── queue()      → QueueRepository     (Outbox)                   │
//! │       └── snapshot_to(path)  VACUUM INTO                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! File databases use WAL so outbox reads don't wait on collection writes.
//! `:memory:` databases are pinned to one connection that never idles out.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migrations;
use crate::repository::document::DocumentRepository;
use crate::repository::queue::QueueRepository;

// =============================================================================
// Configuration
// =============================================================================

/// Pool settings for the terminal database.
///
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/till/till.db").max_connections(4);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file (`:memory:` for tests).
    pub database_path: PathBuf,

    pub max_connections: u32,

    pub min_connections: u32,

    /// Connection acquire timeout.
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection. `None` keeps connections
    /// forever, which an in-memory database needs to keep its data.
    pub idle_timeout: Option<Duration>,

    /// Apply `migrations/sqlite` when the pool opens.
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a configuration for a database file. The file is created if
    /// it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Throwaway database for tests. Each `:memory:` connection is a separate
    /// database, hence the single pinned connection.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
            run_migrations: true,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path == Path::new(":memory:")
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the embedded database, handing out repositories.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates the pool and, unless disabled, runs migrations.
    pub async fn new(config: DbConfig) -> StoreResult<Self> {
        info!(path = %config.database_path.display(), "Opening terminal database");

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let mut connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| StoreError::Configuration(e.to_string()))?
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        if !config.is_in_memory() {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Database(format!("connection failed: {e}")))?;

        debug!(
            max = config.max_connections,
            in_memory = config.is_in_memory(),
            "SQLite pool ready"
        );

        let db = Database { pool };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Applies pending migrations. Idempotent.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// The raw pool, for `execute_raw`.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Document repository (collections).
    pub fn documents(&self) -> DocumentRepository {
        DocumentRepository::new(self.pool.clone())
    }

    /// Outbox queue repository.
    pub fn queue(&self) -> QueueRepository {
        QueueRepository::new(self.pool.clone())
    }

    /// Writes a consistent copy of the database to `path`.
    ///
    /// Uses `VACUUM INTO`, which works while other connections are reading
    /// and produces a compacted standalone file. The target must not exist.
    pub async fn snapshot_to(&self, path: &Path) -> StoreResult<()> {
        if path.exists() {
            return Err(StoreError::Configuration(format!(
                "snapshot target already exists: {}",
                path.display()
            )));
        }
        info!(path = %path.display(), "Writing database snapshot");
        sqlx::query("VACUUM INTO ?1")
            .bind(path.display().to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Closes the pool. Safe to call more than once.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            info!("Closing terminal database");
            self.pool.close().await;
        }
    }

    /// True when the pool is open.
    pub fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Checks the database answers queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
