//! Read-only ledger client.
//!
//! The ledger is the system of record for which identifiers exist and who
//! owns each. Every call is idempotent, so network faults are retried with
//! bounded backoff by [`RetryingLedger`].

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use mintforge_core::{OwnerRef, RetryPolicy, TokenId};

pub mod json_rpc;

pub use json_rpc::{JsonRpcLedger, JsonRpcLedgerConfig, MAX_BATCH_CALLS};

/// Ledger client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Network fault, 5xx or rate limit; worth retrying.
    #[error("ledger transport error: {0}")]
    Transport(String),

    /// The call reverted (e.g. `OwnerOf` for an unassigned identifier).
    #[error("ledger call reverted: {0}")]
    Reverted(String),

    /// The endpoint refused the request itself.
    #[error("ledger rejected request: {0}")]
    Rejected(String),

    #[error("malformed ledger response: {0}")]
    Decode(String),

    /// Transport faults persisted through every retry.
    #[error("ledger unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transport(_))
    }
}

/// Per-identifier owner lookup result.
pub type OwnerLookup = (TokenId, Result<OwnerRef, LedgerError>);

/// Read-only view of the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Exclusive upper bound of assigned identifiers (identifiers start at 1).
    async fn current_count(&self) -> Result<u64, LedgerError>;

    /// Attribution owner of an assigned identifier.
    async fn owner_of(&self, id: TokenId) -> Result<OwnerRef, LedgerError>;

    /// Resolve several owners.
    ///
    /// The outer error means the lookup as a whole failed at transport level;
    /// per-identifier failures (reverts) are reported inline.
    async fn owners_of(&self, ids: &[TokenId]) -> Result<Vec<OwnerLookup>, LedgerError> {
        let mut lookups = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.owner_of(id).await {
                Err(e) if e.is_retryable() => return Err(e),
                result => lookups.push((id, result)),
            }
        }
        Ok(lookups)
    }
}

/// Ledger decorator that retries transport faults with exponential backoff.
///
/// `policy.max_attempts` is the number of retries after the first call; once
/// exhausted the last fault surfaces as [`LedgerError::Unavailable`].
#[derive(Debug)]
pub struct RetryingLedger<L> {
    inner: L,
    policy: RetryPolicy,
}

impl<L: Ledger> RetryingLedger<L> {
    /// Three retries at 1s / 2s / 4s.
    pub fn new(inner: L) -> Self {
        Self::with_policy(
            inner,
            RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(4)),
        )
    }

    pub fn with_policy(inner: L, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut retries = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if !self.policy.should_retry(retries) {
                        warn!(op, attempts = retries + 1, error = %e, "ledger_unavailable");
                        return Err(LedgerError::Unavailable {
                            attempts: retries + 1,
                            last: e.to_string(),
                        });
                    }
                    retries += 1;
                    let delay = self.policy.delay_for_attempt(retries);
                    warn!(
                        op,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "ledger call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<L: Ledger> Ledger for RetryingLedger<L> {
    async fn current_count(&self) -> Result<u64, LedgerError> {
        self.with_retry("current_count", || self.inner.current_count())
            .await
    }

    async fn owner_of(&self, id: TokenId) -> Result<OwnerRef, LedgerError> {
        self.with_retry("owner_of", || self.inner.owner_of(id)).await
    }

    async fn owners_of(&self, ids: &[TokenId]) -> Result<Vec<OwnerLookup>, LedgerError> {
        self.with_retry("owners_of", || self.inner.owners_of(ids))
            .await
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    owners: BTreeMap<TokenId, OwnerRef>,
    reverted: HashSet<TokenId>,
    count_override: Option<u64>,
    failures_remaining: u32,
    calls: u64,
}

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign an identifier to an owner.
    pub fn mint(&self, id: TokenId, owner: OwnerRef) {
        self.lock().owners.insert(id, owner);
    }

    /// Make `owner_of(id)` revert even though the id is counted.
    pub fn revert_owner_of(&self, id: TokenId) {
        self.lock().reverted.insert(id);
    }

    /// Report `count` regardless of what has been minted.
    pub fn set_count(&self, count: u64) {
        self.lock().count_override = Some(count);
    }

    /// Fail the next `n` calls with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.lock().failures_remaining = n;
    }

    /// Total calls served, failed ones included.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    fn begin_call(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        let mut state = self.lock();
        state.calls += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(LedgerError::Transport("injected failure".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn current_count(&self) -> Result<u64, LedgerError> {
        let state = self.begin_call()?;
        if let Some(count) = state.count_override {
            return Ok(count);
        }
        Ok(state
            .owners
            .keys()
            .next_back()
            .map(|id| id.get() + 1)
            .unwrap_or(1))
    }

    async fn owner_of(&self, id: TokenId) -> Result<OwnerRef, LedgerError> {
        let state = self.begin_call()?;
        if state.reverted.contains(&id) {
            return Err(LedgerError::Reverted(format!("owner_of({id})")));
        }
        state
            .owners
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::Reverted(format!("owner_of({id}): nonexistent token")))
    }
}
