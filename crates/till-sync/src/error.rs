//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Auth        │  │     Transport           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Unauthorized   │  │  Transport (unreachable │ │
//! │  │  ConfigLoad/Save│  │  AuthRejected   │  │   or timed out)         │ │
//! │  │  (no request)   │  │  (re-auth next) │  │  (retry next tick)      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ ServerRejection │  │  DataIntegrity  │  │  Local                  │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  non-2xx, or    │  │  duplicate      │  │  Storage / Decode       │ │
//! │  │  success=false  │  │  natural key    │  │  UnsupportedOperation   │ │
//! │  │                 │  │                 │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Observers never see these directly: [`SyncError::user_message`] collapses
//! any of them into a short status line.

use thiserror::Error;
use till_core::CoreError;
use till_store::StoreError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration: endpoint unresolved, bad values.
    ///
    /// ## When This Occurs
    /// - No server URL while sync is enabled
    /// - URL is not http(s) or carries a placeholder
    /// - Zero batch sizes or intervals
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// The server refused the session token (HTTP 401).
    #[error("Session token rejected by server")]
    Unauthorized,

    /// The auth endpoint refused to issue a token.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Server unreachable or the request timed out.
    #[error("Transport failed: {0}")]
    Transport(String),

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// Non-2xx response unrelated to auth.
    #[error("Server rejected request with HTTP {status}: {message}")]
    ServerRejection { status: u16, message: String },

    /// 2xx response with `success: false`.
    #[error("Server reported failure: {0}")]
    ServerFailure(String),

    /// Response body did not match the expected shape.
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// No pusher is registered for an outbox operation kind.
    #[error("No pusher registered for operation kind '{0}'")]
    UnsupportedOperation(String),

    /// Two records share a natural key that must be unique.
    #[error("Duplicate {collection} records for key {key}")]
    DataIntegrity { collection: String, key: String },

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A local value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] CoreError),

    /// The component is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::InvalidResponse(err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 401 => SyncError::Unauthorized,
            Some(status) => SyncError::ServerRejection {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SyncError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::InvalidResponse(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidConfig(format!("invalid URL: {err}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the same request may succeed later unchanged.
    ///
    /// ## Retryable Errors
    /// - Transport failures and timeouts
    /// - 5xx responses and `success: false`
    /// - 401 (after re-authentication)
    /// - Retryable storage failures
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - 4xx rejections other than 401
    /// - Malformed payloads and responses
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Unauthorized | SyncError::ServerFailure(_) => true,
            SyncError::ServerRejection { status, .. } => *status >= 500 || *status == 429,
            SyncError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error should drop the session and re-authenticate.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Unauthorized | SyncError::AuthRejected(_))
    }

    /// Returns true if this is a configuration error needing user attention.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::Storage(StoreError::Configuration(_))
        )
    }

    /// Returns true if the server could not be reached at all.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Storage(StoreError::Transport(_))
        )
    }

    /// Short status line for observers. Never carries protocol detail.
    pub fn user_message(&self) -> &'static str {
        if self.is_config_error() {
            "Sync is not configured"
        } else if self.is_offline() {
            "Server unreachable"
        } else if self.is_auth_error() {
            "Signing in to server"
        } else {
            match self {
                SyncError::ServerRejection { .. }
                | SyncError::ServerFailure(_)
                | SyncError::InvalidResponse(_) => "Server error, will retry",
                SyncError::DataIntegrity { .. } => "Repairing local data",
                SyncError::ShuttingDown => "Stopping",
                _ => "Local storage error",
            }
        }
    }
}
