//! Job model: one unit of pipeline work per ledger token.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──▶ claimed ──synthesized──▶ uploading ──(next stage)──▶ done
//!    ▲                  │
//!    └──retry (attempts+1)
//!                       └──permanent / budget exhausted──▶ failed
//! ```
//!
//! `uploading` is the handoff to the next pipeline stage; this crate never
//! moves a job out of it. `failed` only leaves via an explicit operator reset.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{OwnerRef, TokenId};

/// Default retry budget per job.
pub const MAX_ATTEMPTS: u32 = 3;

/// `last_error` is truncated to this many characters before it is stored.
pub const LAST_ERROR_MAX_CHARS: usize = 500;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Reserved by exactly one scheduler instance
    Claimed,
    /// Synthesis succeeded; owned by the upload stage from here on
    Uploading,
    /// Finished by a later pipeline stage
    Done,
    /// Terminal until an operator resets it
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Uploading,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Uploading => "uploading",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// Statuses that carry a synthesis result.
    pub fn has_result(&self) -> bool {
        matches!(self, JobStatus::Uploading | JobStatus::Done)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Transition committed by the processor for a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Synthesis succeeded: `claimed → uploading`.
    Synthesized { result_ref: String },
    /// Retryable fault: `claimed → pending` with the new attempt count.
    Retry { attempts: u32, last_error: String },
    /// Permanent fault or exhausted budget: `claimed → failed`.
    Failed { attempts: u32, last_error: String },
}

impl JobOutcome {
    pub fn synthesized(result_ref: impl Into<String>) -> Self {
        Self::Synthesized {
            result_ref: result_ref.into(),
        }
    }

    pub fn retry(attempts: u32, error: &str) -> Self {
        Self::Retry {
            attempts,
            last_error: truncate_error(error),
        }
    }

    pub fn failed(attempts: u32, error: &str) -> Self {
        Self::Failed {
            attempts,
            last_error: truncate_error(error),
        }
    }

    /// Status the job ends up in once this outcome is committed.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Synthesized { .. } => JobStatus::Uploading,
            JobOutcome::Retry { .. } => JobStatus::Pending,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            JobOutcome::Synthesized { .. } => None,
            JobOutcome::Retry { last_error, .. } | JobOutcome::Failed { last_error, .. } => {
                Some(last_error)
            }
        }
    }
}

/// A pipeline job (one row per ledger token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Ledger identifier; primary key
    pub id: TokenId,
    /// Attribution owner resolved at creation time
    pub owner_ref: OwnerRef,
    pub status: JobStatus,
    /// Retry attempts consumed so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Location of the synthesized artifact
    pub result_ref: Option<String>,
    /// FIFO ordering key; never mutated
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(id: TokenId, owner_ref: OwnerRef, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_ref,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            result_ref: None,
            discovered_at,
            updated_at: discovered_at,
        }
    }

    /// Whether a scheduler may claim this job.
    pub fn is_claimable(&self, max_attempts: u32) -> bool {
        self.status == JobStatus::Pending && self.attempts < max_attempts
    }

    /// Mark job as claimed.
    pub fn claim(&mut self, max_attempts: u32) -> DomainResult<()> {
        if !self.is_claimable(max_attempts) {
            return Err(DomainError::invalid_transition(format!(
                "job {} is {} with {} attempts; not claimable",
                self.id, self.status, self.attempts
            )));
        }
        self.status = JobStatus::Claimed;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Commit a processor outcome. Only the claim holder calls this, so the
    /// job must currently be `claimed`.
    pub fn apply(&mut self, outcome: &JobOutcome) -> DomainResult<()> {
        if self.status != JobStatus::Claimed {
            return Err(DomainError::invalid_transition(format!(
                "job {} is {}; outcomes apply to claimed jobs only",
                self.id, self.status
            )));
        }

        match outcome {
            JobOutcome::Synthesized { result_ref } => {
                if result_ref.trim().is_empty() {
                    return Err(DomainError::invariant("result_ref must not be empty"));
                }
                self.result_ref = Some(result_ref.clone());
                self.last_error = None;
            }
            JobOutcome::Retry {
                attempts,
                last_error,
            }
            | JobOutcome::Failed {
                attempts,
                last_error,
            } => {
                if *attempts < self.attempts {
                    return Err(DomainError::invariant(format!(
                        "attempts cannot decrease ({} -> {})",
                        self.attempts, attempts
                    )));
                }
                self.attempts = *attempts;
                self.last_error = Some(truncate_error(last_error));
            }
        }

        self.status = outcome.status();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reset a job orphaned in `claimed` by a crashed instance.
    ///
    /// Returns `false` (and leaves the job untouched) when the job is not an
    /// orphan or has already spent its retry budget.
    pub fn recover_orphan(&mut self, max_attempts: u32) -> bool {
        if self.status != JobStatus::Claimed || self.attempts >= max_attempts {
            return false;
        }
        self.status = JobStatus::Pending;
        self.updated_at = Utc::now();
        true
    }

    /// Whether an operator reset applies: failed jobs, and orphans stuck in
    /// `claimed` at the retry budget.
    pub fn needs_operator_reset(&self, max_attempts: u32) -> bool {
        match self.status {
            JobStatus::Failed => true,
            JobStatus::Claimed => self.attempts >= max_attempts,
            _ => false,
        }
    }

    /// Explicit operator reset: `attempts = 0, status = pending`.
    pub fn operator_reset(&mut self, max_attempts: u32) -> DomainResult<()> {
        if !self.needs_operator_reset(max_attempts) {
            return Err(DomainError::invalid_transition(format!(
                "job {} is {} with {} attempts; nothing to reset",
                self.id, self.status, self.attempts
            )));
        }
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Check the row-level invariants.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self, max_attempts: u32) -> DomainResult<()> {
        if self.attempts > max_attempts {
            return Err(DomainError::invariant(format!(
                "job {}: attempts {} exceed budget {}",
                self.id, self.attempts, max_attempts
            )));
        }
        if self.status.has_result() && self.result_ref.is_none() {
            return Err(DomainError::invariant(format!(
                "job {}: {} without result_ref",
                self.id, self.status
            )));
        }
        if self.status == JobStatus::Failed && self.last_error.is_none() {
            return Err(DomainError::invariant(format!(
                "job {}: failed without last_error",
                self.id
            )));
        }
        Ok(())
    }
}

/// Truncate an error message to [`LAST_ERROR_MAX_CHARS`] characters.
pub fn truncate_error(msg: &str) -> String {
    match msg.char_indices().nth(LAST_ERROR_MAX_CHARS) {
        Some((idx, _)) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}
