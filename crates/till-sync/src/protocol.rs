//! # Sync Protocol
//!
//! JSON messages exchanged with the sync server.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST /sync/auth                 AuthRequest      → AuthResponse        │
//! │  GET  /sync/delta/{c}?since=ts   (X-Sync-Token)   → DeltaResponse       │
//! │  POST /sync/transactions         TransactionPush  → TransactionAck      │
//! │  POST /sync/inventory/movements  MovementPush     → MovementAck         │
//! │  GET  /status                    connectivity probe                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Decoding
//! Every response is an envelope with a boolean `success`. The envelope is
//! checked first: `success: false` becomes [`SyncError::ServerFailure`]
//! carrying the server's message. Only a successful envelope is decoded into
//! its typed response, and every field of that response is required.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use till_core::{CoreResult, Record, SessionToken, StockMovement};

use crate::error::{SyncError, SyncResult};

/// Header carrying the session token.
pub const TOKEN_HEADER: &str = "X-Sync-Token";

// =============================================================================
// Auth
// =============================================================================

/// `POST /sync/auth` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub terminal_id: String,
}

/// `POST /sync/auth` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    pub token: String,
    pub terminal_id: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
}

impl AuthResponse {
    /// Turns the response into a session token issued now.
    ///
    /// The server must echo the terminal id we asked for; a token for
    /// another terminal is never accepted.
    pub fn into_session(self, requested_terminal: &str) -> SyncResult<SessionToken> {
        if self.token.is_empty() {
            return Err(SyncError::InvalidResponse("auth token is empty".into()));
        }
        if self.terminal_id != requested_terminal {
            return Err(SyncError::AuthRejected(format!(
                "token issued for terminal '{}', expected '{}'",
                self.terminal_id, requested_terminal
            )));
        }
        Ok(SessionToken::issue(self.token, self.terminal_id, self.expires_in))
    }
}

// =============================================================================
// Delta Pull
// =============================================================================

/// `GET /sync/delta/{collection}` response.
///
/// Items stay raw JSON here so one malformed item cannot sink the whole
/// batch. [`DeltaResponse::records`] validates them one by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub success: bool,
    pub items: Vec<Value>,
    pub is_full_download: bool,
    pub server_time: DateTime<Utc>,
}

impl DeltaResponse {
    /// Each item decoded into a [`Record`], in server order.
    pub fn records(&self) -> Vec<CoreResult<Record>> {
        self.items.iter().cloned().map(Record::from_value).collect()
    }
}

// =============================================================================
// Push
// =============================================================================

/// `POST /sync/transactions` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPush {
    pub items: Vec<Record>,
}

/// `POST /sync/transactions` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAck {
    pub success: bool,
    pub added_count: u64,
}

/// `POST /sync/inventory/movements` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementPush {
    pub items: Vec<StockMovement>,
}

/// `POST /sync/inventory/movements` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementAck {
    pub success: bool,
    pub added_count: u64,
    /// Ids the server has durably recorded (newly or previously).
    pub processed_ids: Vec<String>,
}

// =============================================================================
// Envelope Decoding
// =============================================================================

/// Decodes a 2xx response body into `T`, honouring the `success` flag.
pub fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> SyncResult<T> {
    let value: Value = serde_json::from_slice(body)?;

    match value.get("success") {
        Some(Value::Bool(true)) => Ok(serde_json::from_value(value)?),
        Some(Value::Bool(false)) => {
            let message = value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string();
            Err(SyncError::ServerFailure(message))
        }
        _ => Err(SyncError::InvalidResponse(
            "response has no boolean 'success' field".into(),
        )),
    }
}
