//! # Sync Configuration
//!
//! Configuration management for the terminal's sync runtime.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                            │
//! │     TILL_SERVER_URL=http://10.0.0.5:8080                                │
//! │     TILL_TERMINAL_NAME="Till 2"                                         │
//! │     TILL_STORAGE_BACKEND=sqlite                                         │
//! │     TILL_DATA_DIR=/var/lib/till                                         │
//! │     TILL_SYNC_INTERVAL_SECS=30                                          │
//! │     TILL_OFFLINE=true                                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                    │
//! │     ~/.config/till/till.toml (Linux)                                    │
//! │     ~/Library/Application Support/com.till.pos/till.toml (macOS)        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [terminal]
//! name = "Till 1"
//!
//! [server]
//! url = "http://10.0.0.5:8080"
//! request_timeout_secs = 20
//! health_timeout_secs = 3
//!
//! [sync]
//! interval_secs = 30
//! push_batch_size = 50
//!
//! [outbox]
//! batch_size = 5
//! max_attempts = 10   # 0 = retry forever
//!
//! [storage]
//! backend = "sqlite"  # sqlite | key_value | remote
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use till_core::collection::DEFAULT_PULL_ORDER;
use till_store::remote::validate_endpoint;

use crate::error::{SyncError, SyncResult};
use crate::outbox::RetryPolicy;

/// Config file name inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "till.toml";

// =============================================================================
// Terminal Configuration
// =============================================================================

/// Configuration for this terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Human-readable terminal name (e.g., "Till 1", "Back Office").
    #[serde(default = "default_terminal_name")]
    pub name: String,

    /// Explicit terminal id. When unset, an id is generated on first run
    /// and persisted locally.
    #[serde(default)]
    pub id: Option<String>,
}

fn default_terminal_name() -> String {
    "Till".to_string()
}

impl Default for TerminalConfig {
    fn default() -> Self {
        TerminalConfig {
            name: default_terminal_name(),
            id: None,
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Where the central server lives and how patiently to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the sync server.
    #[serde(default)]
    pub url: Option<String>,

    /// Per-request timeout for pull and push (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for the `/status` connectivity probe (seconds).
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Extra attempts for idempotent GETs after a transport failure.
    #[serde(default = "default_max_request_retries")]
    pub max_request_retries: u32,

    /// Initial backoff between GET retries (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff between GET retries (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_request_timeout() -> u64 {
    20
}
fn default_health_timeout() -> u64 {
    3
}
fn default_max_request_retries() -> u32 {
    2
}
fn default_initial_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    2_000
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            url: None,
            request_timeout_secs: default_request_timeout(),
            health_timeout_secs: default_health_timeout(),
            max_request_retries: default_max_request_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Run without a server: no engine, no outbox delivery.
    #[serde(default)]
    pub offline: bool,

    /// Interval between sync cycles (seconds).
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Transactions sent per push request.
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: u32,

    /// Collections pulled each cycle, in order. Reference data first,
    /// ledger before the balances derived from it.
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
}

fn default_sync_interval() -> u64 {
    30
}
fn default_push_batch_size() -> u32 {
    50
}
fn default_collections() -> Vec<String> {
    DEFAULT_PULL_ORDER.iter().map(|c| c.to_string()).collect()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            offline: false,
            interval_secs: default_sync_interval(),
            push_batch_size: default_push_batch_size(),
            collections: default_collections(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// =============================================================================
// Outbox Settings
// =============================================================================

/// Outbox delivery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxSettings {
    /// Items delivered per `process()` call.
    #[serde(default = "default_outbox_batch")]
    pub batch_size: u32,

    /// Interval of the background delivery timer (seconds).
    #[serde(default = "default_outbox_interval")]
    pub interval_secs: u64,

    /// Failed attempts before an item moves to ERROR.
    /// Set to 0 to retry forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// SYNCED items older than this are purged (days).
    #[serde(default = "default_purge_days")]
    pub purge_synced_after_days: u32,
}

fn default_outbox_batch() -> u32 {
    5
}
fn default_outbox_interval() -> u64 {
    15
}
fn default_max_attempts() -> u32 {
    10
}
fn default_purge_days() -> u32 {
    7
}

impl Default for OutboxSettings {
    fn default() -> Self {
        OutboxSettings {
            batch_size: default_outbox_batch(),
            interval_secs: default_outbox_interval(),
            max_attempts: default_max_attempts(),
            purge_synced_after_days: default_purge_days(),
        }
    }
}

impl OutboxSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retry policy derived from `max_attempts`.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.max_attempts {
            0 => RetryPolicy::Forever,
            n => RetryPolicy::GiveUpAfter(n),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Which backend holds local collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Embedded SQLite (also holds the outbox queue).
    #[default]
    Sqlite,
    /// JSON snapshot file.
    KeyValue,
    /// Server-side collections via the REST proxy.
    Remote,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Sqlite => write!(f, "sqlite"),
            StorageBackend::KeyValue => write!(f, "key_value"),
            StorageBackend::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sql" => Ok(StorageBackend::Sqlite),
            "key_value" | "kv" | "json" => Ok(StorageBackend::KeyValue),
            "remote" | "proxy" => Ok(StorageBackend::Remote),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown storage backend: '{}'. Valid options: sqlite, key_value, remote",
                other
            ))),
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory for the database, snapshot file, and queue.
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Base URL for the remote backend. Defaults to the server URL.
    #[serde(default)]
    pub remote_url: Option<String>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub terminal: TerminalConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (till.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns defaults if loading fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.sync.offline {
            match self.server.url.as_deref() {
                None => {
                    return Err(SyncError::InvalidConfig(
                        "server.url is required unless sync.offline is set".into(),
                    ))
                }
                Some(url) => {
                    validate_endpoint(url)
                        .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
                }
            }
        }

        if self.storage.backend == StorageBackend::Remote {
            let url = self
                .remote_url()
                .ok_or_else(|| SyncError::InvalidConfig("remote storage needs a URL".into()))?;
            validate_endpoint(url).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if self.sync.push_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.push_batch_size must be greater than 0".into(),
            ));
        }
        if self.outbox.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "outbox.batch_size must be greater than 0".into(),
            ));
        }
        if self.sync.interval_secs == 0 || self.outbox.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "intervals must be at least one second".into(),
            ));
        }
        if self.sync.collections.is_empty() {
            return Err(SyncError::InvalidConfig(
                "sync.collections must name at least one collection".into(),
            ));
        }
        if self.terminal.name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("terminal.name is empty".into()));
        }
        if let Some(id) = &self.terminal.id {
            if id.trim().is_empty() {
                return Err(SyncError::InvalidConfig("terminal.id is empty".into()));
            }
        }

        Ok(())
    }

    /// Applies overrides from a variable lookup (the environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TILL_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.url = Some(url);
        }

        if let Some(name) = lookup("TILL_TERMINAL_NAME") {
            self.terminal.name = name;
        }

        if let Some(backend) = lookup("TILL_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => {
                    debug!(backend = %backend, "Overriding storage backend from environment");
                    self.storage.backend = parsed;
                }
                Err(_) => warn!(backend = %backend, "Unknown storage backend in environment"),
            }
        }

        if let Some(dir) = lookup("TILL_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(secs) = lookup("TILL_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.interval_secs = s,
                Err(_) => warn!(value = %secs, "Invalid TILL_SYNC_INTERVAL_SECS"),
            }
        }

        if let Some(offline) = lookup("TILL_OFFLINE") {
            match offline.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.sync.offline = true,
                "0" | "false" | "no" => self.sync.offline = false,
                _ => warn!(value = %offline, "Invalid TILL_OFFLINE"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Directory holding local state.
    pub fn data_dir(&self) -> SyncResult<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| SyncError::InvalidConfig("no data directory available".into()))
    }

    /// Base URL for the remote storage backend.
    pub fn remote_url(&self) -> Option<&str> {
        self.storage
            .remote_url
            .as_deref()
            .or(self.server.url.as_deref())
    }

    /// Returns the server URL if configured.
    pub fn server_url(&self) -> Option<&str> {
        self.server.url.as_deref()
    }

    /// Returns true if sync is enabled.
    pub fn is_sync_enabled(&self) -> bool {
        !self.sync.offline
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "till", "pos")
}

/// Path of the SQLite database inside `data_dir`.
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("till.db")
}

/// Path of the key-value snapshot inside `data_dir`.
pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join("store.json")
}
