//! Ingestion listener: the low-latency path that creates a job as soon as a
//! mint is observed.

use std::sync::Arc;

use tracing::instrument;

use mintforge_core::{OwnerRef, TokenId};

use crate::jobs::store::{InsertOutcome, JobStore, JobStoreError, NewJob, insert_job_idempotent};

/// Creates jobs for mint notifications. Races with the gap reconciler are
/// resolved by the store's primary key; the loser sees `Duplicate`.
#[derive(Clone)]
pub struct IngestionListener {
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for IngestionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionListener").finish_non_exhaustive()
    }
}

impl IngestionListener {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(token_id = %id, owner = %owner), err)]
    pub async fn on_token_minted(
        &self,
        id: TokenId,
        owner: OwnerRef,
    ) -> Result<InsertOutcome, JobStoreError> {
        insert_job_idempotent(&*self.store, NewJob::new(id, owner), "ingestion").await
    }
}
