//! # Sync Status
//!
//! The only sync information collaborators (and end users) ever see: a
//! coarse state, when we last synced, and how much is still queued. Raw
//! protocol errors stay inside the engine.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │        ┌──────┐  cycle starts   ┌─────────┐   success   ┌──────┐        │
//! │        │ IDLE │ ──────────────► │ SYNCING │ ──────────► │ IDLE │        │
//! │        └──────┘                 └────┬────┘             └──────┘        │
//! │            ▲                         │ failure                          │
//! │            │   next good cycle       ▼                                  │
//! │            └─────────────────── ┌───────┐                               │
//! │                                 │ ERROR │                               │
//! │                                 └───────┘                               │
//! │                                                                         │
//! │   Any state ── connectivity lost ──► OFFLINE ── probe ok ──► IDLE       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Coarse engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
    Offline,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "IDLE"),
            SyncState::Syncing => write!(f, "SYNCING"),
            SyncState::Error => write!(f, "ERROR"),
            SyncState::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Snapshot published to observers after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Completion time of the last fully successful cycle.
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Outbox items still waiting for delivery.
    pub pending_count: u64,
    /// Short, user-safe description of the last failure.
    pub message: Option<String>,
}

impl SyncStatus {
    /// True when data may be stale because the last cycle did not finish.
    pub fn is_stale(&self) -> bool {
        matches!(self.state, SyncState::Error | SyncState::Offline)
    }
}
