// Keyfed — Import Coordinator
//
// Entry points behind the HTTP routes and the CLI. `schedule` fans out one
// task per partner through a bounded pool; `import` forces a single
// partner. Both run under one deadline fixed by the caller, so partners
// still queued for a worker when it passes fail instead of running late.
// A per-process guard keeps the same partner from running twice here even
// before the lease table gets a say.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::store::{FederationStore, StoreError};

use super::error::{ErrorKind, ImportError};
use super::scheduler::{CycleOutcome, RunMode, Scheduler, SkipReason};

#[derive(Debug, Clone, Serialize)]
pub struct PartnerResult {
    pub partner: String,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSummary {
    /// False when any partner failed.
    pub ok: bool,
    pub results: Vec<PartnerResult>,
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Removes a partner from the in-flight set when its cycle ends.
struct InFlightGuard {
    set: InFlight,
    name: String,
}

impl InFlightGuard {
    fn claim(set: &InFlight, name: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        inserted.then(|| Self {
            set: set.clone(),
            name: name.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

pub struct Coordinator<S> {
    scheduler: Arc<Scheduler<S>>,
    store: Arc<S>,
    pool: Arc<Semaphore>,
    in_flight: InFlight,
}

impl<S: FederationStore> Coordinator<S> {
    pub fn new(scheduler: Arc<Scheduler<S>>, store: Arc<S>, worker_pool_size: usize) -> Self {
        Self {
            scheduler,
            store,
            pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Deadline for a trigger starting now.
    pub fn trigger_deadline(&self) -> Instant {
        Instant::now() + self.scheduler.config().trigger_timeout
    }

    /// Run a due-mode cycle for every partner. Individual failures are
    /// reported in the summary; only failing to list partners is an error.
    pub async fn schedule(&self, deadline: Instant) -> Result<ScheduleSummary, StoreError> {
        let partners = self.store.list_partners()?;
        tracing::info!(partners = partners.len(), "Schedule pass started");

        let mut pending = Vec::with_capacity(partners.len());
        for partner in partners {
            if !partner.enabled {
                pending.push((partner.name, None));
                continue;
            }
            let task = tokio::spawn(run_one(
                self.scheduler.clone(),
                self.pool.clone(),
                self.in_flight.clone(),
                partner.name.clone(),
                RunMode::Due,
                deadline,
            ));
            pending.push((partner.name, Some(task)));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (partner, task) in pending {
            let outcome = match task {
                None => CycleOutcome::Skipped {
                    reason: SkipReason::Disabled,
                },
                Some(handle) => handle.await.unwrap_or_else(|e| {
                    tracing::error!(partner = %partner, error = %e, "Import task panicked");
                    CycleOutcome::Failed {
                        kind: ErrorKind::TaskPanicked,
                        reason: e.to_string(),
                        batches_merged: 0,
                        cursor: None,
                    }
                }),
            };
            results.push(PartnerResult { partner, outcome });
        }

        let ok = results.iter().all(|r| !r.outcome.is_failure());
        tracing::info!(
            ok,
            failed = results.iter().filter(|r| r.outcome.is_failure()).count(),
            "Schedule pass finished"
        );
        Ok(ScheduleSummary { ok, results })
    }

    /// Force a cycle for one partner, bypassing its cadence.
    pub async fn import(&self, name: &str, deadline: Instant) -> Result<CycleOutcome, ImportError> {
        if self.store.get_partner(name)?.is_none() {
            return Err(ImportError::PartnerNotFound(name.to_string()));
        }
        Ok(run_one(
            self.scheduler.clone(),
            self.pool.clone(),
            self.in_flight.clone(),
            name.to_string(),
            RunMode::Forced,
            deadline,
        )
        .await)
    }

    /// Liveness: the store answers.
    pub fn health(&self) -> Result<(), StoreError> {
        self.store.ping()
    }
}

async fn run_one<S: FederationStore>(
    scheduler: Arc<Scheduler<S>>,
    pool: Arc<Semaphore>,
    in_flight: InFlight,
    name: String,
    mode: RunMode,
    deadline: Instant,
) -> CycleOutcome {
    let Some(_guard) = InFlightGuard::claim(&in_flight, &name) else {
        tracing::info!(partner = %name, "Cycle already running in this process");
        return CycleOutcome::Skipped {
            reason: SkipReason::InProgress,
        };
    };

    // The pool is never closed, so acquisition only waits.
    let _permit = match tokio::time::timeout_at(deadline, pool.acquire_owned()).await {
        Ok(permit) => permit.ok(),
        Err(_) => {
            tracing::warn!(partner = %name, "Trigger deadline passed while waiting for a worker");
            return CycleOutcome::failed(&ImportError::DeadlineExceeded, None);
        }
    };
    let deadline = deadline.min(Instant::now() + scheduler.config().max_runtime);
    scheduler.run_cycle(&name, mode, deadline).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
