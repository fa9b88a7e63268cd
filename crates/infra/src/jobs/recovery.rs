//! Startup recovery of jobs orphaned in `claimed` by a crashed instance.

use serde::Serialize;
use tracing::{info, instrument, warn};

use mintforge_core::{JobStatus, TokenId};

use super::store::{JobStore, JobStoreError};

/// Claimed rows inspected when looking for jobs stuck at the budget.
const STUCK_SCAN_LIMIT: usize = 1000;

/// Result of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs returned to `pending`
    pub recovered: u64,
    /// Jobs left in `claimed` because their retry budget is spent
    pub stuck: Vec<TokenId>,
}

/// Return orphaned claims to `pending`.
///
/// Runs once before the scheduler starts. Claimed jobs that have already
/// spent their budget stay put; they need an operator reset, otherwise a
/// job that crashes the worker would be retried forever.
#[instrument(skip(store), err)]
pub async fn recover_orphans(
    store: &dyn JobStore,
    max_attempts: u32,
) -> Result<RecoveryReport, JobStoreError> {
    let recovered = store.recover_orphans(max_attempts).await?;
    info!(recovered, "orphans_recovered");

    let stuck: Vec<TokenId> = store
        .list_by_status(JobStatus::Claimed, STUCK_SCAN_LIMIT)
        .await?
        .into_iter()
        .filter(|job| job.attempts >= max_attempts)
        .map(|job| job.id)
        .collect();

    if !stuck.is_empty() {
        warn!(
            count = stuck.len(),
            ids = ?stuck,
            "claimed jobs at retry budget need an operator reset"
        );
    }

    Ok(RecoveryReport { recovered, stuck })
}
