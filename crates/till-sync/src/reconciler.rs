//! # Reconciler
//!
//! Startup pass that removes duplicate derived records.
//!
//! Two terminals can each create a balance for the same (product, location)
//! while offline. After both sync, the local store holds two records for one
//! natural key. The reconciler keeps the most recently updated record of each
//! such group and deletes the others. Running it again changes nothing.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use till_core::collection::default_natural_keys;
use till_core::stock::find_duplicates;
use till_core::NaturalKeySpec;
use till_store::SerializedStore;

use crate::error::SyncResult;

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Distinct natural keys seen across all checked collections.
    pub groups_examined: usize,
    pub duplicates_removed: usize,
}

/// Repairs natural-key uniqueness in local collections.
pub struct Reconciler {
    store: Arc<SerializedStore>,
    specs: Vec<NaturalKeySpec>,
}

impl Reconciler {
    /// Reconciler over the default natural keys.
    pub fn new(store: Arc<SerializedStore>) -> Self {
        Self::with_specs(store, default_natural_keys())
    }

    pub fn with_specs(store: Arc<SerializedStore>, specs: Vec<NaturalKeySpec>) -> Self {
        Reconciler { store, specs }
    }

    /// Runs one pass over every configured collection.
    pub async fn run(&self) -> SyncResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for spec in &self.specs {
            let batch = self.store.write_batch().await;
            let records = batch.get_collection(&spec.collection).await?;

            let keys: BTreeSet<_> = records.iter().filter_map(|r| spec.key_of(r)).collect();
            report.groups_examined += keys.len();

            for group in find_duplicates(&records, spec) {
                for id in &group.remove {
                    batch.delete_document(&spec.collection, id).await?;
                    debug!(
                        collection = %spec.collection,
                        key = ?group.key.parts(),
                        kept = %group.keep,
                        removed = %id,
                        "Removed duplicate record"
                    );
                }
                report.duplicates_removed += group.remove.len();
            }
        }

        if report.duplicates_removed > 0 {
            info!(
                groups = report.groups_examined,
                removed = report.duplicates_removed,
                "Reconciled duplicate records"
            );
        } else {
            debug!(groups = report.groups_examined, "No duplicate records found");
        }
        Ok(report)
    }
}
