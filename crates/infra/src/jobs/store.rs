//! Job storage: the store abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use mintforge_core::{DomainError, Job, JobOutcome, JobStatus, OwnerRef, TokenId};

/// A job to be created from a ledger observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: TokenId,
    pub owner_ref: OwnerRef,
}

impl NewJob {
    pub fn new(id: TokenId, owner_ref: OwnerRef) -> Self {
        Self { id, owner_ref }
    }
}

/// A job reserved by this process, with its owner's prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job: Job,
    /// `None` when the owner has not set a prompt yet.
    pub prompt: Option<String>,
}

/// Result of an idempotent insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Created,
    /// Another producer already created the row.
    #[serde(rename = "duplicate_skipped")]
    Duplicate,
}

/// Kind of audit record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ContentPolicyRejection,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ContentPolicyRejection => "content_policy_rejection",
        }
    }
}

/// Moderation audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub job_id: TokenId,
    pub kind: AuditKind,
    /// For content-policy rejections: the original prompt.
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn content_policy_rejection(job_id: TokenId, original_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            kind: AuditKind::ContentPolicyRejection,
            detail: original_prompt.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub claimed: u64,
    pub uploading: u64,
    pub done: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Claimed => self.claimed += count,
            JobStatus::Uploading => self.uploading += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.uploading + self.done + self.failed
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    Duplicate(TokenId),
    #[error("job not found: {0}")]
    NotFound(TokenId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) | DomainError::InvariantViolation(msg) => {
                JobStoreError::InvalidTransition(msg)
            }
            other => JobStoreError::Corrupt(other.to_string()),
        }
    }
}

/// Job store abstraction.
///
/// The store is the only shared mutable resource in the pipeline. Every
/// implementation must make `claim_batch` exclusive: a pending row is handed
/// to at most one caller, even across processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Resolve or create the owner record, then insert a pending job.
    ///
    /// Fails with [`JobStoreError::Duplicate`] when the id already exists.
    async fn insert_job(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by id.
    async fn get(&self, id: TokenId) -> Result<Option<Job>, JobStoreError>;

    /// Identifiers in `[1, upper_exclusive)` with no job row, ascending.
    async fn missing_ids(
        &self,
        upper_exclusive: u64,
        limit: Option<usize>,
    ) -> Result<Vec<TokenId>, JobStoreError>;

    /// Atomically claim up to `batch_size` pending jobs with
    /// `attempts < max_attempts`, oldest `discovered_at` first, skipping rows
    /// another claimer holds. Claimed rows are `claimed` when this returns.
    async fn claim_batch(
        &self,
        batch_size: usize,
        max_attempts: u32,
    ) -> Result<Vec<ClaimedJob>, JobStoreError>;

    /// Commit a processor outcome for a job this process has claimed.
    async fn commit_outcome(&self, id: TokenId, outcome: &JobOutcome)
    -> Result<Job, JobStoreError>;

    /// Persist a moderation audit record.
    async fn record_audit(&self, event: &AuditEvent) -> Result<(), JobStoreError>;

    /// Reset `claimed` rows with `attempts < max_attempts` to `pending`.
    /// Returns the number of rows reset.
    async fn recover_orphans(&self, max_attempts: u32) -> Result<u64, JobStoreError>;

    /// List jobs in a status, oldest first.
    async fn list_by_status(&self, status: JobStatus, limit: usize)
    -> Result<Vec<Job>, JobStoreError>;

    /// Jobs an operator reset would touch: `failed` rows, and `claimed` rows
    /// at the retry budget. An empty `ids` slice means "any".
    async fn list_resettable(
        &self,
        ids: &[TokenId],
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Operator reset (`attempts = 0, status = pending`) of the jobs
    /// `list_resettable` would return. Returns the ids reset.
    async fn reset_for_retry(
        &self,
        ids: &[TokenId],
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<TokenId>, JobStoreError>;

    /// Job counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Insert a job, treating a duplicate as a benign, logged no-op.
///
/// Both the gap reconciler and the ingestion listener create jobs; whichever
/// loses the race lands here.
pub async fn insert_job_idempotent(
    store: &dyn JobStore,
    job: NewJob,
    source: &'static str,
) -> Result<InsertOutcome, JobStoreError> {
    let id = job.id;
    match store.insert_job(job).await {
        Ok(_) => Ok(InsertOutcome::Created),
        Err(JobStoreError::Duplicate(_)) => {
            info!(job_id = %id, source, "duplicate_skipped");
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<TokenId, Job>,
    owners: HashMap<OwnerRef, Option<String>>,
    audit: Vec<AuditEvent>,
}

impl State {
    fn resettable(&self, ids: &[TokenId], limit: usize, max_attempts: u32) -> Vec<TokenId> {
        self.jobs
            .values()
            .filter(|j| j.needs_operator_reset(max_attempts))
            .filter(|j| ids.is_empty() || ids.contains(&j.id))
            .map(|j| j.id)
            .take(limit)
            .collect()
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex serializes every operation, which makes `claim_batch`
/// trivially exclusive.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    /// Set (or replace) the prompt an owner wants rendered.
    pub fn set_owner_prompt(
        &self,
        owner: &OwnerRef,
        prompt: impl Into<String>,
    ) -> Result<(), JobStoreError> {
        self.lock()?.owners.insert(owner.clone(), Some(prompt.into()));
        Ok(())
    }

    /// Insert or overwrite a raw row, bypassing lifecycle checks.
    pub fn put_job(&self, job: Job) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        state.owners.entry(job.owner_ref.clone()).or_insert(None);
        state.jobs.insert(job.id, job);
        Ok(())
    }

    /// All audit records, in insertion order.
    pub fn audit_events(&self) -> Result<Vec<AuditEvent>, JobStoreError> {
        Ok(self.lock()?.audit.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut state = self.lock()?;
        if state.jobs.contains_key(&job.id) {
            return Err(JobStoreError::Duplicate(job.id));
        }
        state.owners.entry(job.owner_ref.clone()).or_insert(None);

        let created = Job::new(job.id, job.owner_ref, Utc::now());
        state.jobs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: TokenId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn missing_ids(
        &self,
        upper_exclusive: u64,
        limit: Option<usize>,
    ) -> Result<Vec<TokenId>, JobStoreError> {
        let state = self.lock()?;
        let limit = limit.unwrap_or(usize::MAX);
        let mut missing = Vec::new();

        for raw in 1..upper_exclusive {
            if missing.len() >= limit {
                break;
            }
            let id = TokenId::new(raw)?;
            if !state.jobs.contains_key(&id) {
                missing.push(id);
            }
        }

        Ok(missing)
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        max_attempts: u32,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        let mut state = self.lock()?;

        let mut candidates: Vec<(DateTime<Utc>, TokenId)> = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(max_attempts))
            .map(|j| (j.discovered_at, j.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.claim(max_attempts)?;
            let job = job.clone();
            let prompt = state.owners.get(&job.owner_ref).cloned().flatten();
            claimed.push(ClaimedJob { job, prompt });
        }

        Ok(claimed)
    }

    async fn commit_outcome(
        &self,
        id: TokenId,
        outcome: &JobOutcome,
    ) -> Result<Job, JobStoreError> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.apply(outcome)?;
        Ok(job.clone())
    }

    async fn record_audit(&self, event: &AuditEvent) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        if !state.jobs.contains_key(&event.job_id) {
            return Err(JobStoreError::NotFound(event.job_id));
        }
        state.audit.push(event.clone());
        Ok(())
    }

    async fn recover_orphans(&self, max_attempts: u32) -> Result<u64, JobStoreError> {
        let mut state = self.lock()?;
        let reset = state
            .jobs
            .values_mut()
            .map(|j| j.recover_orphan(max_attempts))
            .filter(|reset| *reset)
            .count();
        Ok(reset as u64)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.discovered_at, j.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn list_resettable(
        &self,
        ids: &[TokenId],
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<Job>, JobStoreError> {
        let state = self.lock()?;
        Ok(state
            .resettable(ids, limit, max_attempts)
            .into_iter()
            .filter_map(|id| state.jobs.get(&id).cloned())
            .collect())
    }

    async fn reset_for_retry(
        &self,
        ids: &[TokenId],
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<TokenId>, JobStoreError> {
        let mut state = self.lock()?;
        let targets = state.resettable(ids, limit, max_attempts);
        for id in &targets {
            if let Some(job) = state.jobs.get_mut(id) {
                job.operator_reset(max_attempts)?;
            }
        }
        Ok(targets)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use mintforge_core::MAX_ATTEMPTS;

    fn owner(n: u8) -> OwnerRef {
        OwnerRef::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn token(n: u64) -> TokenId {
        TokenId::new(n).unwrap()
    }

    async fn seed(store: &InMemoryJobStore, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            store.insert_job(NewJob::new(token(id), owner(1))).await.unwrap();
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        store.insert_job(NewJob::new(token(1), owner(1))).await.unwrap();

        let err = store
            .insert_job(NewJob::new(token(1), owner(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Duplicate(id) if id == token(1)));

        let outcome = insert_job_idempotent(&store, NewJob::new(token(1), owner(2)), "test")
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Duplicate);

        let job = store.get(token(1)).await.unwrap().unwrap();
        assert_eq!(job.owner_ref, owner(1));
    }

    #[tokio::test]
    async fn missing_ids_is_the_gap_below_the_counter() {
        let store = InMemoryJobStore::new();
        seed(&store, [1, 2, 4, 7]).await;

        let missing = store.missing_ids(9, None).await.unwrap();
        assert_eq!(missing, vec![token(3), token(5), token(6), token(8)]);

        let limited = store.missing_ids(9, Some(2)).await.unwrap();
        assert_eq!(limited, vec![token(3), token(5)]);

        assert!(store.missing_ids(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_bounded() {
        let store = InMemoryJobStore::new();
        let base = Utc::now();
        for (id, offset) in [(3u64, 0i64), (1, 2), (2, 1)] {
            let mut job = Job::new(token(id), owner(1), base + chrono::Duration::seconds(offset));
            job.updated_at = base;
            store.put_job(job).unwrap();
        }
        store.set_owner_prompt(&owner(1), "a lighthouse at dusk").unwrap();

        let batch = store.claim_batch(2, MAX_ATTEMPTS).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|c| c.job.id).collect();
        assert_eq!(ids, vec![token(3), token(2)]);
        assert!(batch.iter().all(|c| c.job.status == JobStatus::Claimed));
        assert_eq!(batch[0].prompt.as_deref(), Some("a lighthouse at dusk"));

        let rest = store.claim_batch(10, MAX_ATTEMPTS).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.claim_batch(10, MAX_ATTEMPTS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_skips_exhausted_jobs() {
        let store = InMemoryJobStore::new();
        let mut job = Job::new(token(1), owner(1), Utc::now());
        job.attempts = MAX_ATTEMPTS;
        store.put_job(job).unwrap();

        assert!(store.claim_batch(10, MAX_ATTEMPTS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_requires_claim() {
        let store = InMemoryJobStore::new();
        seed(&store, [1]).await;

        let err = store
            .commit_outcome(token(1), &JobOutcome::synthesized("ipfs://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition(_)));

        store.claim_batch(1, MAX_ATTEMPTS).await.unwrap();
        let job = store
            .commit_outcome(token(1), &JobOutcome::synthesized("ipfs://x"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Uploading);
    }

    #[tokio::test]
    async fn recover_orphans_respects_budget() {
        let store = InMemoryJobStore::new();
        for (id, attempts) in [(1u64, 2u32), (2, 3)] {
            let mut job = Job::new(token(id), owner(1), Utc::now());
            job.status = JobStatus::Claimed;
            job.attempts = attempts;
            store.put_job(job).unwrap();
        }

        assert_eq!(store.recover_orphans(3).await.unwrap(), 1);
        assert_eq!(store.get(token(1)).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(store.get(token(2)).await.unwrap().unwrap().status, JobStatus::Claimed);
    }

    #[tokio::test]
    async fn operator_reset_targets_failed_and_stuck_jobs() {
        let store = InMemoryJobStore::new();
        seed(&store, [1, 2]).await;
        store.claim_batch(2, MAX_ATTEMPTS).await.unwrap();
        store
            .commit_outcome(token(1), &JobOutcome::failed(1, "unauthorized"))
            .await
            .unwrap();
        store
            .commit_outcome(token(2), &JobOutcome::synthesized("ipfs://ok"))
            .await
            .unwrap();

        let mut stuck = Job::new(token(3), owner(1), Utc::now());
        stuck.status = JobStatus::Claimed;
        stuck.attempts = MAX_ATTEMPTS;
        store.put_job(stuck).unwrap();

        let preview = store.list_resettable(&[], 10, MAX_ATTEMPTS).await.unwrap();
        assert_eq!(preview.len(), 2);

        let only_one = store
            .reset_for_retry(&[token(3)], 10, MAX_ATTEMPTS)
            .await
            .unwrap();
        assert_eq!(only_one, vec![token(3)]);

        let reset = store.reset_for_retry(&[], 10, MAX_ATTEMPTS).await.unwrap();
        assert_eq!(reset, vec![token(1)]);

        let job = store.get(token(1)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        seed(&store, 1..=5).await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 5);

        store.claim_batch(2, MAX_ATTEMPTS).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.total(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_row() {
        let store = InMemoryJobStore::arc();
        seed(&store, 1..=200).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(7, MAX_ATTEMPTS).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|c| c.job.id));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 200);
    }
}
