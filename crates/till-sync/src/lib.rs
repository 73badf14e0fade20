//! # till-sync: Offline-First Sync for Till
//!
//! Keeps a terminal's local collections consistent with the central server
//! across dropped connections, restarts and concurrent writes from other
//! terminals.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Till Sync Layer                                │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncRuntime (application root)                   │  │
//! │  │  Builds everything from SyncConfig, owns lifetimes               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   SyncEngine   │  │     Outbox     │  │      Reconciler        │    │
//! │  │                │  │                │  │                        │    │
//! │  │ auth, push,    │  │ durable queue, │  │ startup dedup of       │    │
//! │  │ pull, apply,   │  │ pushers, retry │  │ natural-key groups     │    │
//! │  │ recompute      │  │ policy, timer  │  │                        │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          ▼                   ▼                                          │
//! │  ┌────────────────┐  ┌────────────────┐                                │
//! │  │ SessionManager │  │    SyncApi     │  HttpSyncApi (reqwest)         │
//! │  │ identity+token │  │ /sync/* JSON   │                                │
//! │  └────────────────┘  └────────────────┘                                │
//! │                                                                         │
//! │  STATUS (to observers via watch channel / SyncEventEmitter):           │
//! │  • IDLE / SYNCING / ERROR / OFFLINE                                    │
//! │  • last successful sync time                                           │
//! │  • pending outbox items                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`client`] - `SyncApi` trait and its HTTP implementation
//! - [`config`] - TOML + environment configuration
//! - [`engine`] - The sync cycle and its run loop
//! - [`error`] - Sync error types
//! - [`outbox`] - Queue delivery, pushers, retry policy
//! - [`protocol`] - Wire messages
//! - [`reconciler`] - Duplicate repair
//! - [`runtime`] - Application root
//! - [`session`] - Terminal identity and session token

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod outbox;
pub mod protocol;
pub mod reconciler;
pub mod runtime;
pub mod session;

#[cfg(test)]
mod testing;

pub use client::{HttpSyncApi, SyncApi};
pub use config::{StorageBackend, SyncConfig};
pub use engine::{
    CollectionReport, CycleOutcome, CycleReport, EngineHandle, NoOpEmitter, SyncEngine,
    SyncEventEmitter,
};
pub use error::{SyncError, SyncResult};
pub use outbox::{
    DeliveryReport, MovementPusher, OperationPusher, Outbox, OutboxHandle, OutboxOptions,
    PusherRegistry, RetryPolicy, StubPusher, TransactionPusher,
};
pub use reconciler::{ReconcileReport, Reconciler};
pub use runtime::{RuntimeOptions, SyncRuntime};
pub use session::{load_or_create_identity, SessionManager};
