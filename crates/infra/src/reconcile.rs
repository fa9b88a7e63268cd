//! Gap reconciliation: create jobs for ledger identifiers the store lacks.
//!
//! The reconciler is the catch-up path. It runs before the scheduler starts
//! and may run again on an interval or on demand; every pass is idempotent
//! because job creation is.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use mintforge_core::TokenId;

use crate::jobs::processor::shutdown_requested;
use crate::jobs::store::{InsertOutcome, JobStore, JobStoreError, NewJob, insert_job_idempotent};
use crate::ledger::{Ledger, LedgerError, MAX_BATCH_CALLS};

/// Reconciliation error. Either way the pass is aborted; rows already
/// created stay valid.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Examine at most this many missing identifiers (lowest first)
    pub limit: Option<usize>,
    /// Report the gap without resolving owners or creating jobs
    pub dry_run: bool,
}

/// What a reconciliation pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub ledger_count: u64,
    pub missing: usize,
    pub created: usize,
    /// Jobs another producer created first
    pub duplicates_skipped: usize,
    /// Identifiers whose owner lookup reverted; retried on the next pass
    pub unresolved: Vec<TokenId>,
    pub dry_run: bool,
}

/// Compares the ledger counter against the job store and fills the gap.
#[derive(Clone)]
pub struct GapReconciler {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn JobStore>,
    owner_batch_size: usize,
}

impl std::fmt::Debug for GapReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapReconciler")
            .field("owner_batch_size", &self.owner_batch_size)
            .finish_non_exhaustive()
    }
}

impl GapReconciler {
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<dyn JobStore>) -> Self {
        Self {
            ledger,
            store,
            owner_batch_size: MAX_BATCH_CALLS,
        }
    }

    /// Owner lookups per ledger round trip.
    pub fn with_owner_batch_size(mut self, size: usize) -> Self {
        self.owner_batch_size = size.max(1);
        self
    }

    /// Run one reconciliation pass.
    ///
    /// The missing set is computed by the store in one set-oriented query.
    /// Owner lookups go out in batches; an identifier whose lookup reverts is
    /// skipped and reported. A ledger outage aborts the pass.
    #[instrument(skip(self), err)]
    pub async fn reconcile(
        &self,
        options: ReconcileOptions,
    ) -> Result<ReconcileReport, ReconcileError> {
        let ledger_count = self.ledger.current_count().await?;
        let missing = self.store.missing_ids(ledger_count, options.limit).await?;

        let mut report = ReconcileReport {
            ledger_count,
            missing: missing.len(),
            dry_run: options.dry_run,
            ..ReconcileReport::default()
        };

        if options.dry_run || missing.is_empty() {
            info!(
                ledger_count,
                missing = report.missing,
                dry_run = options.dry_run,
                "reconcile_completed"
            );
            return Ok(report);
        }

        for chunk in missing.chunks(self.owner_batch_size) {
            let lookups = self.ledger.owners_of(chunk).await?;

            for (id, lookup) in lookups {
                let owner = match lookup {
                    Ok(owner) => owner,
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "owner lookup failed; leaving gap for next pass");
                        report.unresolved.push(id);
                        continue;
                    }
                };

                match insert_job_idempotent(&*self.store, NewJob::new(id, owner), "reconciler").await? {
                    InsertOutcome::Created => report.created += 1,
                    InsertOutcome::Duplicate => report.duplicates_skipped += 1,
                }
            }
        }

        info!(
            ledger_count,
            missing = report.missing,
            created = report.created,
            duplicates_skipped = report.duplicates_skipped,
            unresolved = report.unresolved.len(),
            "reconcile_completed"
        );
        Ok(report)
    }

    /// Re-run reconciliation every `interval` until shutdown. Failed passes
    /// are logged and retried on the next tick.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "periodic reconciliation started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            if let Err(e) = self.reconcile(ReconcileOptions::default()).await {
                error!(error = %e, "periodic reconciliation failed");
            }
        }
        info!("periodic reconciliation stopped");
    }
}
