// Keyfed — Merge Engine

use std::sync::Arc;

use crate::store::{BatchToMerge, KeyStore, MergeReport, Partner, StoreError};

use super::validate::VerifiedBatch;

/// Applies verified batches to the key store, one transaction per batch.
pub struct MergeEngine<S> {
    store: Arc<S>,
    chunk_size: usize,
}

impl<S: KeyStore> MergeEngine<S> {
    pub fn new(store: Arc<S>, chunk_size: usize) -> Self {
        Self { store, chunk_size }
    }

    pub fn merge(&self, partner: &Partner, batch: VerifiedBatch) -> Result<MergeReport, StoreError> {
        let position = batch.position;
        let to_merge = BatchToMerge {
            partner: partner.name.clone(),
            position,
            digest: batch.digest,
            region: partner.region.clone(),
            keys: batch.keys,
        };

        let report = self.store.merge_batch(&to_merge, self.chunk_size)?;

        tracing::info!(
            partner = %partner.name,
            position,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "Batch merged"
        );
        Ok(report)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
