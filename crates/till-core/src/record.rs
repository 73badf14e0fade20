//! # Records
//!
//! A [`Record`] is any domain document the sync engine moves around:
//! products, customers, ledger entries, stock balances. The engine does not
//! know their schemas, only three things about them:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  { "id": "p-001",              ← opaque identity (required, string)     │
//! │    "name": "Cola 330ml",       ← arbitrary fields (untouched)           │
//! │    "updatedAt": "2024-...Z",   ← recency, used by the reconciler        │
//! │    "deleted": true }           ← deletion marker (optional)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Construction always goes through validation: there is no way to hold a
//! `Record` without a non-empty string id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Field holding the record identity.
pub const ID_FIELD: &str = "id";

/// Field holding the last-modified timestamp.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Field holding the creation timestamp.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// A schemaless domain document with a guaranteed string id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Record(fields)
    }

    /// Validates a JSON object and wraps it.
    pub fn from_map(fields: Map<String, Value>) -> CoreResult<Self> {
        match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => Ok(Record(fields)),
            _ => Err(CoreError::MissingId),
        }
    }

    /// Validates an arbitrary JSON value and wraps it.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(fields) => Self::from_map(fields),
            other => Err(CoreError::NotAnObject(type_name(&other).to_string())),
        }
    }

    /// Parses a JSON string into a record.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Builder-style field setter. Setting `id` through here is ignored.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// The record id.
    pub fn id(&self) -> &str {
        // from_map guarantees the field is a string; `set` refuses to replace it
        self.0.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default()
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns a field as a string slice.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Returns a field as an integer, accepting integral floats.
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.0.get(field)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            _ => None,
        }
    }

    /// Sets a field. The id is immutable once constructed.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        if field == ID_FIELD {
            return;
        }
        self.0.insert(field.to_string(), value.into());
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        if field == ID_FIELD {
            return None;
        }
        self.0.remove(field)
    }

    /// True when the record carries a deletion marker.
    ///
    /// Recognised markers: `"deleted": true`, `"isDeleted": true`, or any
    /// non-null `"deletedAt"`.
    pub fn is_deleted(&self) -> bool {
        let flag = |name: &str| matches!(self.0.get(name), Some(Value::Bool(true)));
        let stamped = matches!(self.0.get("deletedAt"), Some(v) if !v.is_null());
        flag("deleted") || flag("isDeleted") || stamped
    }

    /// When this record was last modified, if it says so.
    ///
    /// Falls back to `createdAt` when `updatedAt` is missing or unparsable.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(UPDATED_AT_FIELD)
            .or_else(|| self.timestamp(CREATED_AT_FIELD))
    }

    fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get_str(field)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Serializes to a compact JSON string.
    pub fn to_json(&self) -> String {
        // A Map<String, Value> always serializes
        Value::Object(self.0.clone()).to_string()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Record::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for Record {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Record::from_value(value)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
