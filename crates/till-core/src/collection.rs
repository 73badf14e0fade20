//! # Collections and Natural Keys
//!
//! Well-known collection names, the pull priority order, and the composite
//! keys that derived aggregates must stay unique on.
//!
//! ## Pull Priority
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reference data            transactional data        derived           │
//! │  ──────────────            ──────────────────        ───────           │
//! │  categories ─► locations ─► products ─► customers ─► transactions ─►   │
//! │                                          stock_movements ─► stock_balances
//! │                                          (ledger)           (from ledger)
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::record::Record;

pub const CATEGORIES: &str = "categories";
pub const LOCATIONS: &str = "locations";
pub const PRODUCTS: &str = "products";
pub const CUSTOMERS: &str = "customers";
pub const TRANSACTIONS: &str = "transactions";
/// The inventory-movement ledger.
pub const STOCK_MOVEMENTS: &str = "stock_movements";
/// Balances derived from the ledger.
pub const STOCK_BALANCES: &str = "stock_balances";

/// Reserved: per-collection sync cursors.
pub const SYNC_METADATA: &str = "_sync_metadata";
/// Reserved: terminal identity and persisted session token.
pub const TERMINAL: &str = "_terminal";

/// Default order in which collections are pulled.
pub const DEFAULT_PULL_ORDER: &[&str] = &[
    CATEGORIES,
    LOCATIONS,
    PRODUCTS,
    CUSTOMERS,
    TRANSACTIONS,
    STOCK_MOVEMENTS,
    STOCK_BALANCES,
];

/// Returns true for collections owned by the sync engine itself.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with('_')
}

// =============================================================================
// Natural Keys
// =============================================================================

/// Describes the business key a collection must be unique on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKeySpec {
    /// Collection the key applies to.
    pub collection: String,
    /// Ordered list of fields forming the key.
    pub fields: Vec<String>,
}

/// A resolved natural key: one value per key field, in field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    /// Builds a key from raw parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NaturalKey(parts.into_iter().map(Into::into).collect())
    }

    /// Key parts in order.
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.0.join(","))
    }
}

impl NaturalKeySpec {
    /// Creates a spec.
    pub fn new(collection: impl Into<String>, fields: &[&str]) -> Self {
        NaturalKeySpec {
            collection: collection.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// The stock balance key: (productId, locationId).
    pub fn stock_balance() -> Self {
        Self::new(STOCK_BALANCES, &["productId", "locationId"])
    }

    /// Extracts the key from a record.
    ///
    /// Returns `None` when any key field is missing or empty. String and
    /// numeric values are accepted; numbers are rendered canonically.
    pub fn key_of(&self, record: &Record) -> Option<NaturalKey> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let part = match record.get(field)? {
                serde_json::Value::String(s) if !s.is_empty() => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            parts.push(part);
        }
        Some(NaturalKey(parts))
    }
}

/// The natural keys enforced by default.
pub fn default_natural_keys() -> Vec<NaturalKeySpec> {
    vec![NaturalKeySpec::stock_balance()]
}
