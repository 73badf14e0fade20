//! # till-core: Sync Domain Types for Till
//!
//! Pure types and functions shared by the storage and sync crates. Nothing
//! in here touches the disk, the network, or a clock it was not handed.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Till Sync Layering                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/till-agent (binary)                        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │  till-sync   engine · outbox · session · reconciler · client    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │  till-store  StorageAdapter · kv · sqlite · remote              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            ★ till-core (THIS CRATE) ★                           │   │
//! │  │  Record · SyncCursor · QueueItem · SessionToken · stock math    │   │
//! │  │  NO I/O • NO DATABASE • NO NETWORK                              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`] - Schemaless documents with a guaranteed id
//! - [`collection`] - Collection names, pull order, natural keys
//! - [`cursor`] - Per-collection pull watermarks
//! - [`queue`] - Outbox items and typed operations
//! - [`session`] - Session tokens
//! - [`stock`] - Ledger sums and duplicate detection
//! - [`status`] - Observer-facing sync status
//! - [`error`] - Decode/validation errors

// =============================================================================
// Module Declarations
// =============================================================================

pub mod collection;
pub mod cursor;
pub mod error;
pub mod queue;
pub mod record;
pub mod session;
pub mod status;
pub mod stock;

// =============================================================================
// Re-exports
// =============================================================================

pub use collection::{NaturalKey, NaturalKeySpec};
pub use cursor::SyncCursor;
pub use error::{CoreError, CoreResult};
pub use queue::{Operation, QueueItem, QueueStatus, StockMovement};
pub use record::Record;
pub use session::SessionToken;
pub use status::{SyncState, SyncStatus};
