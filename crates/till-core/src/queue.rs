//! # Outbox Queue Types
//!
//! Every outbound operation is a [`QueueItem`] carrying a typed
//! [`Operation`]. The operation kind doubles as the `type` column of the
//! queue table and selects which pusher delivers it.
//!
//! ## Item Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   enqueue ──► PENDING ──── delivered + acknowledged ───► SYNCED         │
//! │                 │  ▲                                                    │
//! │       failure   │  │ retry (retryCount += 1)                            │
//! │                 ▼  │                                                    │
//! │              (still PENDING) ── gave up / non-retryable ──► ERROR       │
//! │                                                              │          │
//! │                                  requeue_errored (manual) ◄──┘          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::record::Record;

// =============================================================================
// Queue Status
// =============================================================================

/// Delivery state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    /// Waiting for delivery (including items that have failed and will retry).
    Pending,
    /// Acknowledged by the server.
    Synced,
    /// Gave up; needs manual requeue.
    Error,
}

impl QueueStatus {
    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::Synced => "SYNCED",
            QueueStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(QueueStatus::Pending),
            "SYNCED" => Ok(QueueStatus::Synced),
            "ERROR" => Ok(QueueStatus::Error),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Stock Movement
// =============================================================================

/// One inventory-movement ledger entry.
///
/// `quantity` is signed: receipts are positive, sales and write-offs
/// negative. Unknown fields ride along in `extra` so nothing the
/// collaborators wrote is lost on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: String,
    pub product_id: String,
    pub location_id: String,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StockMovement {
    /// Creates a movement with a fresh id stamped now.
    pub fn new(
        product_id: impl Into<String>,
        location_id: impl Into<String>,
        quantity: i64,
    ) -> Self {
        StockMovement {
            id: Uuid::new_v4().to_string(),
            product_id: product_id.into(),
            location_id: location_id.into(),
            quantity,
            reason: None,
            created_at: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Sets the movement reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Ledger record form, as stored in the `stock_movements` collection.
    pub fn to_record(&self) -> CoreResult<Record> {
        Record::from_value(serde_json::to_value(self)?)
    }

    /// Decodes a ledger record.
    pub fn from_record(record: &Record) -> CoreResult<Self> {
        serde_json::from_value(record.clone().into_value()).map_err(|e| {
            CoreError::InvalidPayload {
                kind: Operation::INVENTORY_MOVEMENT.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

// =============================================================================
// Operation
// =============================================================================

/// A typed outbound operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// A completed sale or other transaction-like record.
    Transaction(Record),
    /// An inventory-movement ledger entry.
    InventoryMovement(StockMovement),
    /// Anything we have no dedicated pusher for.
    Other { kind: String, payload: Value },
}

impl Operation {
    pub const TRANSACTION: &'static str = "transaction";
    pub const INVENTORY_MOVEMENT: &'static str = "inventory_movement";

    /// The kind string stored in the queue's `type` column.
    pub fn kind(&self) -> &str {
        match self {
            Operation::Transaction(_) => Self::TRANSACTION,
            Operation::InventoryMovement(_) => Self::INVENTORY_MOVEMENT,
            Operation::Other { kind, .. } => kind,
        }
    }

    /// The payload as JSON.
    pub fn payload(&self) -> CoreResult<Value> {
        match self {
            Operation::Transaction(record) => Ok(record.clone().into_value()),
            Operation::InventoryMovement(movement) => Ok(serde_json::to_value(movement)?),
            Operation::Other { payload, .. } => Ok(payload.clone()),
        }
    }

    /// Rebuilds an operation from its stored `(type, payload)` pair.
    ///
    /// Recognised kinds must decode into their typed payload; a malformed
    /// payload is an error, not a silent fallback to [`Operation::Other`].
    pub fn from_parts(kind: &str, payload: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(payload).map_err(|e| CoreError::InvalidPayload {
            kind: kind.to_string(),
            reason: e.to_string(),
        })?;

        match kind {
            Self::TRANSACTION => Record::from_value(value)
                .map(Operation::Transaction)
                .map_err(|e| CoreError::InvalidPayload {
                    kind: kind.to_string(),
                    reason: e.to_string(),
                }),
            Self::INVENTORY_MOVEMENT => serde_json::from_value(value)
                .map(Operation::InventoryMovement)
                .map_err(|e| CoreError::InvalidPayload {
                    kind: kind.to_string(),
                    reason: e.to_string(),
                }),
            other => Ok(Operation::Other {
                kind: other.to_string(),
                payload: value,
            }),
        }
    }
}

// =============================================================================
// Queue Item
// =============================================================================

/// A durable outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub operation: Operation,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl QueueItem {
    /// Creates a new PENDING item.
    ///
    /// Transactions and movements reuse their own id so the server can
    /// deduplicate replays; other kinds get a fresh UUID.
    pub fn new(operation: Operation) -> Self {
        let id = match &operation {
            Operation::Transaction(record) => record.id().to_string(),
            Operation::InventoryMovement(movement) => movement.id.clone(),
            Operation::Other { .. } => Uuid::new_v4().to_string(),
        };

        QueueItem {
            id,
            operation,
            status: QueueStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            error: None,
        }
    }

    /// Shorthand for the operation kind.
    pub fn kind(&self) -> &str {
        self.operation.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_parsing() {
        assert_eq!("PENDING".parse::<QueueStatus>().unwrap(), QueueStatus::Pending);
        assert_eq!("SYNCED".parse::<QueueStatus>().unwrap(), QueueStatus::Synced);
        assert_eq!("ERROR".parse::<QueueStatus>().unwrap(), QueueStatus::Error);
        assert!("pending".parse::<QueueStatus>().is_err());
        assert_eq!(QueueStatus::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_movement_wire_shape() {
        let movement = StockMovement::new("P1", "W1", -2).with_reason("sale");
        let value = serde_json::to_value(&movement).unwrap();
        assert_eq!(value["productId"], "P1");
        assert_eq!(value["locationId"], "W1");
        assert_eq!(value["quantity"], -2);
        assert_eq!(value["reason"], "sale");
        assert!(value.get("product_id").is_none());
    }

    #[test]
    fn test_movement_keeps_unknown_fields() {
        let value = json!({
            "id": "m1",
            "productId": "P1",
            "locationId": "W1",
            "quantity": 5,
            "createdAt": "2024-05-01T10:00:00Z",
            "batchNo": "B-77"
        });
        let movement: StockMovement = serde_json::from_value(value).unwrap();
        assert_eq!(movement.extra.get("batchNo"), Some(&json!("B-77")));

        let record = movement.to_record().unwrap();
        assert_eq!(record.get_str("batchNo"), Some("B-77"));
    }

    #[test]
    fn test_operation_from_parts() {
        let tx = Operation::from_parts("transaction", r#"{"id":"t1","total":500}"#).unwrap();
        assert_eq!(tx.kind(), "transaction");

        let other = Operation::from_parts("customer_note", r#"{"text":"hi"}"#).unwrap();
        assert_eq!(other.kind(), "customer_note");
        assert!(matches!(other, Operation::Other { .. }));
    }

    #[test]
    fn test_recognised_kind_with_bad_payload_fails() {
        let err = Operation::from_parts("inventory_movement", r#"{"id":"m1"}"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));

        let err = Operation::from_parts("transaction", r#"{"total":1}"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload { .. }));

        assert!(Operation::from_parts("anything", "not json").is_err());
    }

    #[test]
    fn test_queue_item_reuses_domain_id() {
        let movement = StockMovement::new("P1", "W1", 1);
        let item = QueueItem::new(Operation::InventoryMovement(movement.clone()));
        assert_eq!(item.id, movement.id);
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);

        let tx = QueueItem::new(Operation::Transaction(Record::new("t-9")));
        assert_eq!(tx.id, "t-9");
    }
}
