//! # Stock Balances
//!
//! Pure functions over the inventory ledger and the balances derived from it.
//!
//! ## Why Full Recompute?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Ledger (stock_movements)               Balance (stock_balances)        │
//! │  ─────────────────────────              ────────────────────────        │
//! │  m1  P2 W1  +10                                                         │
//! │  m2  P2 W1   -3        sum(P2,W1) ──►   { productId: P2,                │
//! │  m7  P2 W1   -1                           locationId: W1,               │
//! │                                           quantity: 6 }                 │
//! │                                                                         │
//! │  A balance is always the sum of the whole ledger for its key. Patching  │
//! │  it with deltas drifts as soon as one delta is replayed or lost.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::collection::{NaturalKey, NaturalKeySpec};
use crate::record::Record;

/// Ledger field names.
pub const PRODUCT_ID: &str = "productId";
pub const LOCATION_ID: &str = "locationId";
pub const QUANTITY: &str = "quantity";

/// The (productId, locationId) key of a ledger entry or balance.
pub fn stock_key(record: &Record) -> Option<NaturalKey> {
    NaturalKeySpec::stock_balance().key_of(record)
}

/// Distinct keys touched by a batch of ledger entries.
///
/// Deleted entries count as touches: removing a movement changes the balance.
pub fn touched_keys<'a, I>(entries: I) -> BTreeSet<NaturalKey>
where
    I: IntoIterator<Item = &'a Record>,
{
    entries.into_iter().filter_map(stock_key).collect()
}

/// Sum of every live ledger entry for `key`.
///
/// Entries without a readable integer quantity are ignored. The sum
/// saturates at the `i64` bounds.
pub fn ledger_balance(ledger: &[Record], key: &NaturalKey) -> i64 {
    ledger
        .iter()
        .filter(|entry| !entry.is_deleted())
        .filter(|entry| stock_key(entry).as_ref() == Some(key))
        .filter_map(|entry| entry.get_i64(QUANTITY))
        .fold(0i64, i64::saturating_add)
}

/// Builds the balance document for a key.
pub fn balance_record(id: &str, key: &NaturalKey, quantity: i64, now: DateTime<Utc>) -> Record {
    let parts = key.parts();
    let product = parts.first().cloned().unwrap_or_default();
    let location = parts.get(1).cloned().unwrap_or_default();
    Record::new(id)
        .with(PRODUCT_ID, product)
        .with(LOCATION_ID, location)
        .with(QUANTITY, quantity)
        .with("updatedAt", now.to_rfc3339_opts(SecondsFormat::Millis, true))
}

// =============================================================================
// Duplicate Detection
// =============================================================================

/// One natural key held by more than one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: NaturalKey,
    /// The record that stays.
    pub keep: String,
    /// Records to delete.
    pub remove: Vec<String>,
}

/// Groups records by natural key and picks a survivor for every group with
/// more than one member.
///
/// The survivor is the most recently updated record. Ties (including records
/// with no timestamp at all) go to the greatest id, so every terminal that
/// runs this over the same data keeps the same record.
pub fn find_duplicates(records: &[Record], spec: &NaturalKeySpec) -> Vec<DuplicateGroup> {
    let mut groups: BTreeMap<NaturalKey, Vec<&Record>> = BTreeMap::new();
    for record in records {
        if let Some(key) = spec.key_of(record) {
            groups.entry(key).or_default().push(record);
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|(key, members)| {
            let keep = members
                .iter()
                .max_by(|a, b| {
                    a.updated_at()
                        .cmp(&b.updated_at())
                        .then_with(|| a.id().cmp(b.id()))
                })?
                .id()
                .to_string();
            let remove = members
                .iter()
                .map(|r| r.id().to_string())
                .filter(|id| *id != keep)
                .collect();
            Some(DuplicateGroup { key, keep, remove })
        })
        .collect()
}
