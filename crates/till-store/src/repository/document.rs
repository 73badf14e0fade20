//! # Document Repository
//!
//! Every collection shares the `documents` table. Bodies are the record's
//! JSON; `updated_at` mirrors the record's recency (or the write time when
//! it has none) for housekeeping queries.
//!
//! Upserts go through `ON CONFLICT ... DO UPDATE`, which keeps the row's
//! `rowid`, so listing by `rowid` yields first-insertion order.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use till_core::Record;

use super::stamp;
use crate::error::StoreResult;

/// Repository for collection documents.
#[derive(Debug, Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

impl DocumentRepository {
    /// Creates a new DocumentRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DocumentRepository { pool }
    }

    /// Inserts or replaces one record.
    pub async fn upsert(&self, collection: &str, record: &Record) -> StoreResult<()> {
        let updated_at = stamp(record.updated_at().unwrap_or_else(Utc::now));

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (collection, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(record.id())
        .bind(record.to_json())
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All records of a collection in insertion order.
    pub async fn list(&self, collection: &str) -> StoreResult<Vec<Record>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM documents WHERE collection = ?1 ORDER BY rowid ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        bodies
            .iter()
            .map(|body| Record::from_json(body).map_err(Into::into))
            .collect()
    }

    /// One record by id.
    pub async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE collection = ?1 AND id = ?2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match body {
            Some(body) => Ok(Some(Record::from_json(&body)?)),
            None => Ok(None),
        }
    }

    /// Deletes one record. Returns whether a row was removed.
    pub async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replaces a whole collection in one transaction.
    ///
    /// Later duplicates of an id overwrite earlier ones in place.
    pub async fn replace(&self, collection: &str, records: &[Record]) -> StoreResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents WHERE collection = ?1")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, id, body, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (collection, id) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(collection)
            .bind(record.id())
            .bind(record.to_json())
            .bind(stamp(record.updated_at().unwrap_or(now)))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(collection = %collection, count = records.len(), "Collection replaced");
        Ok(())
    }

    /// `(collections, documents)` currently stored.
    pub async fn counts(&self) -> StoreResult<(u64, u64)> {
        let (collections, documents): (i64, i64) =
            sqlx::query_as("SELECT COUNT(DISTINCT collection), COUNT(*) FROM documents")
                .fetch_one(&self.pool)
                .await?;

        Ok((collections.max(0) as u64, documents.max(0) as u64))
    }
}
