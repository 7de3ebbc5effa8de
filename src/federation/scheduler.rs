// Keyfed — Import Scheduler
//
// One cycle for one partner: check cadence, take the partner's lease, then
// fetch → validate → merge batch by batch, renewing the lease in between.
// The cycle stops at the first unrecoverable error; whatever merged before
// it stays merged. The lease is released on every exit path, including a
// blown deadline.

use std::sync::Arc;

use chrono::Duration;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::store::{FederationStore, MergeReport, Partner};

use super::error::{ErrorKind, ImportError};
use super::fetch::{BatchSource, Fetcher};
use super::lease::LeaseManager;
use super::merge::MergeEngine;
use super::validate::{SequenceGap, Validator};

/// Whether a cycle honours the partner's cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Due,
    /// Operator-triggered: ignores cadence but still needs the lease.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotDue,
    LeaseUnavailable,
    Disabled,
    InProgress,
}

/// Result of one partner cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Skipped {
        reason: SkipReason,
    },
    Completed {
        batches: usize,
        inserted: usize,
        duplicates: usize,
        gaps: Vec<SequenceGap>,
        cursor: u64,
    },
    Failed {
        kind: ErrorKind,
        reason: String,
        batches_merged: usize,
        /// Absent when the cycle failed before the partner row was read.
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<u64>,
    },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failed { .. })
    }

    pub(crate) fn failed(error: &ImportError, cursor: Option<u64>) -> Self {
        CycleOutcome::Failed {
            kind: error.kind(),
            reason: error.to_string(),
            batches_merged: 0,
            cursor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Identifies this process in the lease table.
    pub holder: String,
    pub lease_ttl: Duration,
    /// Cap on a single partner cycle. Must stay below `lease_ttl`.
    pub max_runtime: std::time::Duration,
    /// Budget for a whole `schedule` or `import` trigger, pool waits included.
    pub trigger_timeout: std::time::Duration,
    /// Consecutive rejected or gapped cycles before alerting.
    pub failure_threshold: u32,
    pub auto_disable: bool,
    pub max_insert_batch_size: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            holder: format!("keyfed-{}", uuid::Uuid::new_v4()),
            lease_ttl: Duration::minutes(15),
            max_runtime: std::time::Duration::from_secs(600),
            trigger_timeout: std::time::Duration::from_secs(1800),
            failure_threshold: 5,
            auto_disable: false,
            max_insert_batch_size: 500,
        }
    }
}

/// Counters carried through a cycle so they survive an aborted future.
#[derive(Debug, Default)]
struct Progress {
    batches: usize,
    inserted: usize,
    duplicates: usize,
    gaps: Vec<SequenceGap>,
    cursor: u64,
}

impl Progress {
    fn starting_at(cursor: u64) -> Self {
        Self {
            cursor,
            ..Default::default()
        }
    }

    fn record(&mut self, position: u64, report: MergeReport) {
        self.batches += 1;
        self.inserted += report.inserted;
        self.duplicates += report.duplicates;
        self.cursor = self.cursor.max(position);
    }
}

pub struct Scheduler<S> {
    store: Arc<S>,
    leases: LeaseManager<S>,
    fetcher: Fetcher,
    validator: Validator,
    merger: MergeEngine<S>,
    clock: Arc<dyn Clock>,
    config: ImportConfig,
}

impl<S: FederationStore> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        source: Arc<dyn BatchSource>,
        clock: Arc<dyn Clock>,
        config: ImportConfig,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store.clone(), clock.clone()),
            fetcher: Fetcher::new(source),
            validator: Validator::new(clock.clone()),
            merger: MergeEngine::new(store.clone(), config.max_insert_batch_size),
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Run one cycle for `name`, giving up at `deadline`.
    pub async fn run_cycle(&self, name: &str, mode: RunMode, deadline: Instant) -> CycleOutcome {
        let partner = match self.load(name) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(partner = %name, error = %e, "Cannot start import cycle");
                return CycleOutcome::failed(&e, None);
            }
        };
        if let Some(reason) = self.skip_reason(&partner, mode) {
            tracing::debug!(partner = %name, ?reason, "Cycle skipped");
            return CycleOutcome::Skipped { reason };
        }

        let holder = self.config.holder.as_str();
        match self.leases.acquire(name, holder, self.config.lease_ttl) {
            Ok(true) => {}
            Ok(false) => {
                return CycleOutcome::Skipped {
                    reason: SkipReason::LeaseUnavailable,
                }
            }
            Err(e) => return CycleOutcome::failed(&ImportError::from(e), Some(partner.cursor)),
        }

        let outcome = self.run_leased(name, mode, deadline).await;

        if let Err(e) = self.leases.release(name, holder) {
            tracing::error!(partner = %name, error = %e, "Failed to release lease; it will expire on its own");
        }
        outcome
    }

    /// Everything after the lease is held. Never returns early without
    /// reporting, so the caller can always release.
    async fn run_leased(&self, name: &str, mode: RunMode, deadline: Instant) -> CycleOutcome {
        // Another instance may have finished a cycle between our first
        // read and the lease, so the cursor must come from a fresh read.
        let partner = match self.load(name) {
            Ok(p) => p,
            Err(e) => return CycleOutcome::failed(&e, None),
        };
        if let Some(reason) = self.skip_reason(&partner, mode) {
            return CycleOutcome::Skipped { reason };
        }

        tracing::info!(
            partner = %name,
            cursor = partner.cursor,
            forced = (mode == RunMode::Forced),
            "Import cycle started"
        );

        let mut progress = Progress::starting_at(partner.cursor);
        let result = match tokio::time::timeout_at(deadline, self.import_batches(&partner, &mut progress)).await {
            Ok(result) => result,
            Err(_) => Err(ImportError::DeadlineExceeded),
        };

        match result {
            Ok(()) => self.finish_success(&partner, progress),
            Err(e) => self.finish_failure(&partner, e, progress),
        }
    }

    async fn import_batches(&self, partner: &Partner, progress: &mut Progress) -> Result<(), ImportError> {
        let holder = self.config.holder.as_str();
        let mut batches = self.fetcher.fetch(partner, progress.cursor).await?;

        while let Some(raw) = batches.next().await {
            let raw = raw?;
            let verified = self
                .validator
                .validate(&raw, partner, progress.cursor)
                .map_err(|reason| ImportError::Rejected {
                    position: raw.position,
                    reason,
                })?;

            if let Some(gap) = verified.gap {
                tracing::warn!(
                    partner = %partner.name,
                    expected = gap.expected,
                    received = gap.received,
                    skipped = gap.skipped(),
                    "Sequence gap in partner export; continuing from the received position"
                );
                progress.gaps.push(gap);
            }

            // A slow fetch can outlive the lease; never merge without it.
            if !self.leases.renew(&partner.name, holder, self.config.lease_ttl)? {
                return Err(ImportError::LeaseLost(partner.name.clone()));
            }

            let position = verified.position;
            let report = self
                .merger
                .merge(partner, verified)
                .map_err(|source| ImportError::Merge { position, source })?;
            progress.record(position, report);
        }
        Ok(())
    }

    fn finish_success(&self, partner: &Partner, progress: Progress) -> CycleOutcome {
        let name = partner.name.as_str();
        if let Err(e) = self.store.record_success(name, self.clock.now()) {
            return self.finish_failure(partner, e.into(), progress);
        }

        let bookkeeping = if progress.gaps.is_empty() {
            self.store.reset_failures(name)
        } else {
            self.bump_failure_streak(name)
        };
        if let Err(e) = bookkeeping {
            tracing::warn!(partner = %name, error = %e, "Failed to update failure streak");
        }

        tracing::info!(
            partner = %name,
            batches = progress.batches,
            inserted = progress.inserted,
            duplicates = progress.duplicates,
            gaps = progress.gaps.len(),
            cursor = progress.cursor,
            "Import cycle completed"
        );

        CycleOutcome::Completed {
            batches: progress.batches,
            inserted: progress.inserted,
            duplicates: progress.duplicates,
            gaps: progress.gaps,
            cursor: progress.cursor,
        }
    }

    fn finish_failure(&self, partner: &Partner, error: ImportError, progress: Progress) -> CycleOutcome {
        let kind = error.kind();
        tracing::error!(
            partner = %partner.name,
            kind = ?kind,
            batches_merged = progress.batches,
            cursor = progress.cursor,
            error = %error,
            "Import cycle failed"
        );

        if kind == ErrorKind::ValidationRejected {
            if let Err(e) = self.bump_failure_streak(&partner.name) {
                tracing::warn!(partner = %partner.name, error = %e, "Failed to update failure streak");
            }
        }

        CycleOutcome::Failed {
            kind,
            reason: error.to_string(),
            batches_merged: progress.batches,
            cursor: Some(progress.cursor),
        }
    }

    fn bump_failure_streak(&self, name: &str) -> Result<(), crate::store::StoreError> {
        let streak = self.store.record_failure(name)?;
        if streak < self.config.failure_threshold {
            return Ok(());
        }

        tracing::error!(
            partner = %name,
            streak,
            threshold = self.config.failure_threshold,
            auto_disable = self.config.auto_disable,
            "ALERT: partner keeps producing rejected or gapped exports"
        );
        if self.config.auto_disable {
            self.store.set_enabled(name, false)?;
            tracing::error!(partner = %name, "Partner disabled after repeated failures");
        }
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Partner, ImportError> {
        self.store
            .get_partner(name)?
            .ok_or_else(|| ImportError::PartnerNotFound(name.to_string()))
    }

    fn skip_reason(&self, partner: &Partner, mode: RunMode) -> Option<SkipReason> {
        if !partner.enabled {
            return Some(SkipReason::Disabled);
        }
        if mode == RunMode::Due && !partner.is_due(self.clock.now()) {
            return Some(SkipReason::NotDue);
        }
        None
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
