//! # SQLite Backend
//!
//! [`StorageAdapter`] over the embedded database. Documents go through
//! [`DocumentRepository`](crate::repository::DocumentRepository); the same
//! [`Database`] also backs the outbox queue, so one file holds all local
//! state.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info};

use till_core::Record;

use crate::adapter::{StorageAdapter, StoreStats};
use crate::error::{StoreError, StoreResult};
use crate::pool::{Database, DbConfig};

/// Embedded relational backend.
#[derive(Debug)]
pub struct SqliteStore {
    config: DbConfig,
    db: Mutex<Option<Database>>,
}

impl SqliteStore {
    /// Creates a store that opens lazily on [`StorageAdapter::connect`].
    pub fn new(config: DbConfig) -> Self {
        SqliteStore {
            config,
            db: Mutex::new(None),
        }
    }

    /// Creates and connects a store over an existing database handle.
    pub fn from_database(config: DbConfig, db: Database) -> Self {
        SqliteStore {
            config,
            db: Mutex::new(Some(db)),
        }
    }

    /// The connected database, for repositories beyond documents.
    pub async fn database(&self) -> StoreResult<Database> {
        self.db.lock().await.clone().ok_or_else(|| {
            StoreError::Configuration("SQLite store used before connect()".into())
        })
    }

    /// Writes a consistent copy of the database to `path`.
    pub async fn snapshot_to(&self, path: &Path) -> StoreResult<()> {
        self.database().await?.snapshot_to(path).await
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> StoreResult<()> {
        let mut guard = self.db.lock().await;
        if guard.as_ref().is_some_and(Database::is_open) {
            return Ok(());
        }
        *guard = Some(Database::new(self.config.clone()).await?);
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        if let Some(db) = self.db.lock().await.take() {
            db.close().await;
        }
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>> {
        self.database().await?.documents().list(name).await
    }

    async fn save_collection(&self, name: &str, records: Vec<Record>) -> StoreResult<()> {
        self.database().await?.documents().replace(name, &records).await
    }

    async fn save_document(&self, name: &str, record: Record) -> StoreResult<()> {
        self.database().await?.documents().upsert(name, &record).await
    }

    async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>> {
        self.database().await?.documents().get(name, id).await
    }

    async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()> {
        let removed = self.database().await?.documents().delete(name, id).await?;
        if removed {
            debug!(collection = %name, id = %id, "Document deleted");
        }
        Ok(())
    }

    async fn execute_raw(&self, query: &str, params: &[Value]) -> StoreResult<Vec<Value>> {
        let db = self.database().await?;
        let mut statement = sqlx::query(query);
        for param in params {
            statement = bind_json(statement, param)?;
        }

        let rows = statement.fetch_all(db.pool()).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let (collections, documents) = self.database().await?.documents().counts().await?;
        info!(collections, documents, "SQLite store stats");
        Ok(StoreStats {
            backend: self.backend_name().to_string(),
            collections,
            documents,
        })
    }
}

// =============================================================================
// Raw Query Helpers
// =============================================================================

type RawQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_json<'q>(statement: RawQuery<'q>, param: &Value) -> StoreResult<RawQuery<'q>> {
    Ok(match param {
        Value::Null => statement.bind(None::<String>),
        Value::Bool(b) => statement.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => statement.bind(i),
            (None, Some(f)) => statement.bind(f),
            _ => {
                return Err(StoreError::Serialization(format!(
                    "numeric parameter out of range: {n}"
                )))
            }
        },
        Value::String(s) => statement.bind(s.clone()),
        Value::Array(_) | Value::Object(_) => statement.bind(param.to_string()),
    })
}

fn row_to_json(row: &SqliteRow) -> StoreResult<Value> {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => Number::from_f64(row.try_get::<f64, _>(index)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(index)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(row.try_get::<String, _>(index)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}
