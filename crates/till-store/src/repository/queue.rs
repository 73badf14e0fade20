//! # Outbox Queue Repository
//!
//! Durable storage for outbound operations.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL OPERATION (e.g., sale completed)                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO sync_queue (id, type, payload) ── status = PENDING         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            DELIVERY (outbox tick or engine push)                │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT ... WHERE status = 'PENDING' ORDER BY created_at     │   │
//! │  │  2. For each item:                                              │   │
//! │  │     a. Send to the server                                       │   │
//! │  │     b. Acknowledged:  status = 'SYNCED'                         │   │
//! │  │     c. Failed:        retry_count += 1, error = ?               │   │
//! │  │                       (status = 'ERROR' when giving up)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                        │
//! │  • An item is never deleted before it is SYNCED                         │
//! │  • Re-inserting an id resets it to PENDING (edits re-deliver)           │
//! │  • Offline? Items queue up. Back online? They drain oldest-first        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use till_core::cursor::parse_timestamp;
use till_core::{CoreResult, Operation, QueueItem, QueueStatus};

use super::stamp;
use crate::error::StoreResult;

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub synced: u64,
    pub error: u64,
}

/// Raw `sync_queue` row.
#[derive(Debug, FromRow)]
struct QueueRow {
    id: String,
    #[sqlx(rename = "type")]
    kind: String,
    payload: String,
    status: String,
    retry_count: i64,
    created_at: String,
    error: Option<String>,
}

impl QueueRow {
    fn into_item(self) -> CoreResult<QueueItem> {
        Ok(QueueItem {
            operation: Operation::from_parts(&self.kind, &self.payload)?,
            status: self.status.parse()?,
            retry_count: self.retry_count.clamp(0, i64::from(u32::MAX)) as u32,
            created_at: parse_timestamp(&self.created_at)?,
            error: self.error,
            id: self.id,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, type, payload, status, retry_count, created_at, error FROM sync_queue";

/// Repository for outbox queue operations.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new QueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    /// Persists an item as PENDING.
    ///
    /// Inserting an id that already exists replaces the payload and resets
    /// the item to PENDING with a zero retry count, keeping its original
    /// position in the queue.
    pub async fn insert(&self, item: &QueueItem) -> StoreResult<()> {
        let payload = item.operation.payload()?.to_string();
        let now = stamp(Utc::now());

        debug!(id = %item.id, kind = %item.kind(), "Queuing for sync");

        sqlx::query(
            r#"
            INSERT INTO sync_queue (id, type, payload, status, retry_count, created_at, updated_at, error)
            VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?5, NULL)
            ON CONFLICT (id) DO UPDATE SET
                type = excluded.type,
                payload = excluded.payload,
                status = 'PENDING',
                retry_count = 0,
                updated_at = excluded.updated_at,
                error = NULL
            "#,
        )
        .bind(&item.id)
        .bind(item.kind())
        .bind(payload)
        .bind(stamp(item.created_at))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One item by id.
    pub async fn get(&self, id: &str) -> StoreResult<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.into_item()?)),
            None => Ok(None),
        }
    }

    /// Oldest PENDING items, at most `limit`.
    pub async fn pending(&self, limit: u32) -> StoreResult<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status = 'PENDING' ORDER BY created_at ASC, rowid ASC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        self.decode_pending(rows).await
    }

    /// Oldest PENDING items of one kind. `None` means no limit.
    pub async fn pending_of_kind(
        &self,
        kind: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status = 'PENDING' AND type = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        ))
        .bind(kind)
        .bind(limit.map(i64::from).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        self.decode_pending(rows).await
    }

    /// Decodes rows, moving any whose payload no longer decodes to ERROR.
    async fn decode_pending(&self, rows: Vec<QueueRow>) -> StoreResult<Vec<QueueItem>> {
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_item() {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(id = %id, error = %e, "Undecodable queue item, moving to ERROR");
                    self.record_failure(&id, &e.to_string(), true).await?;
                }
            }
        }
        Ok(items)
    }

    /// Marks items as SYNCED. Returns how many rows changed.
    pub async fn mark_synced(&self, ids: &[String]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = stamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for id in ids {
            let result = sqlx::query(
                "UPDATE sync_queue SET status = 'SYNCED', error = NULL, updated_at = ?2 WHERE id = ?1",
            )
            .bind(id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }

        tx.commit().await?;

        debug!(count = changed, "Marked queue items synced");
        Ok(changed)
    }

    /// Records a delivery failure.
    ///
    /// Increments the retry count and stores the error. With `give_up` the
    /// item moves to ERROR, otherwise it stays PENDING. Returns the status
    /// the item now has, or `None` if the id is unknown.
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        give_up: bool,
    ) -> StoreResult<Option<QueueStatus>> {
        let status = if give_up {
            QueueStatus::Error
        } else {
            QueueStatus::Pending
        };

        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                retry_count = retry_count + 1,
                error = ?2,
                status = ?3,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(status.as_str())
        .bind(stamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then_some(status))
    }

    /// Moves every ERROR item back to PENDING with a zero retry count.
    pub async fn requeue_errored(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'PENDING',
                retry_count = 0,
                error = NULL,
                updated_at = ?1
            WHERE status = 'ERROR'
            "#,
        )
        .bind(stamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(count, "Requeued errored items");
        }
        Ok(count)
    }

    /// Item counts per status.
    pub async fn counts(&self) -> StoreResult<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<QueueStatus>() {
                Ok(QueueStatus::Pending) => counts.pending = count,
                Ok(QueueStatus::Synced) => counts.synced = count,
                Ok(QueueStatus::Error) => counts.error = count,
                Err(e) => warn!(error = %e, "Ignoring unknown queue status"),
            }
        }
        Ok(counts)
    }

    /// Deletes SYNCED items last touched more than `days` days ago.
    ///
    /// PENDING and ERROR items are never purged.
    pub async fn purge_synced_older_than(&self, days: u32) -> StoreResult<u64> {
        let cutoff = stamp(Utc::now() - Duration::days(i64::from(days)));

        let result =
            sqlx::query("DELETE FROM sync_queue WHERE status = 'SYNCED' AND updated_at < ?1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(count, days, "Purged old synced queue items");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use till_core::{Record, StockMovement};

    async fn setup() -> QueueRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().queue()
    }

    fn tx_item(id: &str) -> QueueItem {
        QueueItem::new(Operation::Transaction(Record::new(id).with("total", 100)))
    }

    #[tokio::test]
    async fn test_insert_and_pending_oldest_first() {
        let repo = setup().await;
        for id in ["t1", "t2", "t3"] {
            repo.insert(&tx_item(id)).await.unwrap();
        }

        let pending = repo.pending(2).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(pending[0].status, QueueStatus::Pending);
        assert_eq!(pending[0].kind(), Operation::TRANSACTION);
    }

    #[tokio::test]
    async fn test_pending_of_kind_filters() {
        let repo = setup().await;
        repo.insert(&tx_item("t1")).await.unwrap();
        let movement = StockMovement::new("P1", "W1", -1);
        repo.insert(&QueueItem::new(Operation::InventoryMovement(movement.clone())))
            .await
            .unwrap();

        let movements = repo
            .pending_of_kind(Operation::INVENTORY_MOVEMENT, None)
            .await
            .unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].operation, Operation::InventoryMovement(movement));
    }

    #[tokio::test]
    async fn test_mark_synced_excludes_from_pending() {
        let repo = setup().await;
        repo.insert(&tx_item("t1")).await.unwrap();
        repo.insert(&tx_item("t2")).await.unwrap();

        let changed = repo
            .mark_synced(&["t1".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let pending = repo.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t2");

        let counts = repo.counts().await.unwrap();
        assert_eq!(counts, QueueCounts { pending: 1, synced: 1, error: 0 });
    }

    #[tokio::test]
    async fn test_record_failure_and_requeue() {
        let repo = setup().await;
        repo.insert(&tx_item("t1")).await.unwrap();

        let status = repo.record_failure("t1", "timeout", false).await.unwrap();
        assert_eq!(status, Some(QueueStatus::Pending));
        let item = repo.get("t1").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error.as_deref(), Some("timeout"));

        let status = repo.record_failure("t1", "rejected", true).await.unwrap();
        assert_eq!(status, Some(QueueStatus::Error));
        assert!(repo.pending(10).await.unwrap().is_empty());

        assert_eq!(repo.record_failure("ghost", "x", true).await.unwrap(), None);

        assert_eq!(repo.requeue_errored().await.unwrap(), 1);
        let item = repo.get("t1").await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.error.is_none());
    }

    #[tokio::test]
    async fn test_reinsert_resets_to_pending() {
        let repo = setup().await;
        repo.insert(&tx_item("t1")).await.unwrap();
        repo.record_failure("t1", "bad", true).await.unwrap();

        repo.insert(&tx_item("t1")).await.unwrap();
        let item = repo.get("t1").await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn test_undecodable_row_moves_to_error() {
        let repo = setup().await;
        let now = stamp(Utc::now());
        sqlx::query(
            "INSERT INTO sync_queue (id, type, payload, created_at, updated_at) VALUES ('bad', 'inventory_movement', '{\"id\":\"bad\"}', ?1, ?1)",
        )
        .bind(&now)
        .execute(&repo.pool)
        .await
        .unwrap();
        repo.insert(&tx_item("t1")).await.unwrap();

        let pending = repo.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t1");
        assert_eq!(repo.counts().await.unwrap().error, 1);
    }

    #[tokio::test]
    async fn test_purge_only_touches_old_synced() {
        let repo = setup().await;
        repo.insert(&tx_item("old")).await.unwrap();
        repo.insert(&tx_item("fresh")).await.unwrap();
        repo.insert(&tx_item("waiting")).await.unwrap();
        repo.mark_synced(&["old".to_string(), "fresh".to_string()])
            .await
            .unwrap();

        let long_ago = stamp(Utc::now() - Duration::days(30));
        sqlx::query("UPDATE sync_queue SET updated_at = ?1 WHERE id IN ('old', 'waiting')")
            .bind(long_ago)
            .execute(&repo.pool)
            .await
            .unwrap();

        assert_eq!(repo.purge_synced_older_than(7).await.unwrap(), 1);
        assert!(repo.get("old").await.unwrap().is_none());
        assert!(repo.get("fresh").await.unwrap().is_some());
        assert!(repo.get("waiting").await.unwrap().is_some());
    }
}
