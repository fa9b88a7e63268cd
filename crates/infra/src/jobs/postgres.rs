//! Postgres-backed job store.
//!
//! Exclusive claiming uses `FOR UPDATE SKIP LOCKED`: concurrent schedulers
//! (in this process or another) each lock a disjoint set of pending rows and
//! never wait on each other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Job id already exists |
//! | Database (foreign key violation) | `23503` | `NotFound` | Audit record for an unknown job |
//! | Database (check constraint violation) | `23514` | `InvalidTransition` | Row would break a lifecycle constraint |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / other | N/A | `Storage` | Network errors, connection failures, etc. |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, field, instrument};

use mintforge_core::{Job, JobOutcome, JobStatus, OwnerRef, TokenId};

use super::store::{AuditEvent, ClaimedJob, JobStats, JobStore, JobStoreError, NewJob};

const JOB_COLUMNS: &str =
    "id, owner_ref, status, attempts, last_error, result_ref, discovered_at, updated_at";

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| JobStoreError::Storage(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Set (or replace) the prompt an owner wants rendered.
    #[instrument(skip(self, prompt), fields(owner = %owner), err)]
    pub async fn set_owner_prompt(
        &self,
        owner: &OwnerRef,
        prompt: &str,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO owners (address, prompt)
            VALUES ($1, $2)
            ON CONFLICT (address)
            DO UPDATE SET prompt = EXCLUDED.prompt, updated_at = now()
            "#,
        )
        .bind(owner.as_str())
        .bind(prompt)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_owner_prompt", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, owner = %job.owner_ref), err)]
    async fn insert_job(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("INSERT INTO owners (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
            .bind(job.owner_ref.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("resolve_owner", e))?;

        let row = sqlx::query(&format!(
            "INSERT INTO jobs (id, owner_ref) VALUES ($1, $2) RETURNING {JOB_COLUMNS}"
        ))
        .bind(job.id.as_i64())
        .bind(job.owner_ref.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::Duplicate(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        decode_job(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: TokenId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(missing = field::Empty), err)]
    async fn missing_ids(
        &self,
        upper_exclusive: u64,
        limit: Option<usize>,
    ) -> Result<Vec<TokenId>, JobStoreError> {
        let upper = i64::try_from(upper_exclusive)
            .map_err(|_| JobStoreError::Storage(format!("counter out of range: {upper_exclusive}")))?;
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query(
            r#"
            SELECT g.id
            FROM generate_series(1::BIGINT, $1::BIGINT - 1) AS g(id)
            WHERE NOT EXISTS (SELECT 1 FROM jobs j WHERE j.id = g.id)
            ORDER BY g.id
            LIMIT $2
            "#,
        )
        .bind(upper)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("missing_ids", e))?;

        let mut missing = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: i64 = row
                .try_get("id")
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            missing.push(TokenId::try_from(raw)?);
        }

        Span::current().record("missing", missing.len());
        Ok(missing)
    }

    #[instrument(skip(self), fields(claimed = field::Empty), err)]
    async fn claim_batch(
        &self,
        batch_size: usize,
        max_attempts: u32,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(&format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND attempts < $1
                ORDER BY discovered_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'claimed', updated_at = now()
            FROM picked
            WHERE jobs.id = picked.id
            RETURNING {},
                (SELECT o.prompt FROM owners o WHERE o.address = jobs.owner_ref) AS prompt
            "#,
            qualified_columns("jobs")
        ))
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // Dropping `tx` on any error below rolls the claim back.
        let mut claimed = rows
            .iter()
            .map(|row| {
                let prompt: Option<String> = row
                    .try_get("prompt")
                    .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
                Ok(ClaimedJob {
                    job: decode_job(row)?,
                    prompt,
                })
            })
            .collect::<Result<Vec<_>, JobStoreError>>()?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        // RETURNING order is unspecified.
        claimed.sort_by_key(|c| (c.job.discovered_at, c.job.id));

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, outcome), fields(job_id = %id, status = %outcome.status()), err)]
    async fn commit_outcome(
        &self,
        id: TokenId,
        outcome: &JobOutcome,
    ) -> Result<Job, JobStoreError> {
        let (attempts, last_error, result_ref) = match outcome {
            JobOutcome::Synthesized { result_ref } => (None, None, Some(result_ref.as_str())),
            JobOutcome::Retry {
                attempts,
                last_error,
            }
            | JobOutcome::Failed {
                attempts,
                last_error,
            } => (
                Some(i32::try_from(*attempts).unwrap_or(i32::MAX)),
                Some(last_error.as_str()),
                None,
            ),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = COALESCE($3::INTEGER, attempts),
                last_error = $4::TEXT,
                result_ref = COALESCE($5::TEXT, result_ref),
                updated_at = now()
            WHERE id = $1
              AND status = 'claimed'
              AND ($3::INTEGER IS NULL OR $3::INTEGER >= attempts)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_i64())
        .bind(outcome.status().as_str())
        .bind(attempts)
        .bind(last_error)
        .bind(result_ref)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("commit_outcome", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => match self.get(id).await? {
                Some(job) => Err(JobStoreError::InvalidTransition(format!(
                    "job {id} is {} with {} attempts; cannot commit {}",
                    job.status,
                    job.attempts,
                    outcome.status()
                ))),
                None => Err(JobStoreError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self, event), fields(job_id = %event.job_id, kind = event.kind.as_str()), err)]
    async fn record_audit(&self, event: &AuditEvent) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_audit_events (id, job_id, kind, detail, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(event.job_id.as_i64())
        .bind(event.kind.as_str())
        .bind(&event.detail)
        .bind(event.recorded_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                JobStoreError::NotFound(event.job_id)
            } else {
                map_sqlx_error("record_audit", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn recover_orphans(&self, max_attempts: u32) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', updated_at = now()
            WHERE status = 'claimed' AND attempts < $1
            "#,
        )
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_orphans", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY discovered_at, id LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()), err)]
    async fn list_resettable(
        &self,
        ids: &[TokenId],
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (status = 'failed' OR (status = 'claimed' AND attempts >= $1))
              AND (cardinality($2::BIGINT[]) = 0 OR id = ANY($2::BIGINT[]))
            ORDER BY id
            LIMIT $3
            "#
        ))
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(ids.iter().map(TokenId::as_i64).collect::<Vec<_>>())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_resettable", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, ids), fields(requested = ids.len(), reset = field::Empty), err)]
    async fn reset_for_retry(
        &self,
        ids: &[TokenId],
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<TokenId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            WITH targets AS (
                SELECT id
                FROM jobs
                WHERE (status = 'failed' OR (status = 'claimed' AND attempts >= $1))
                  AND (cardinality($2::BIGINT[]) = 0 OR id = ANY($2::BIGINT[]))
                ORDER BY id
                LIMIT $3
                FOR UPDATE
            )
            UPDATE jobs
            SET status = 'pending', attempts = 0, updated_at = now()
            FROM targets
            WHERE jobs.id = targets.id
            RETURNING jobs.id
            "#,
        )
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(ids.iter().map(TokenId::as_i64).collect::<Vec<_>>())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_for_retry", e))?;

        let mut reset = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: i64 = row
                .try_get("id")
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            reset.push(TokenId::try_from(raw)?);
        }
        reset.sort();

        Span::current().record("reset", reset.len());
        Ok(reset)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            let count: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            let status: JobStatus = status.parse()?;
            stats.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn qualified_columns(table: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|c| format!("{table}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::InvalidTransition(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        other => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn sqlstate_is(err: &sqlx::Error, code: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(actual) = db_err.code() {
            return actual.as_ref() == code;
        }
    }
    false
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate_is(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    sqlstate_is(err, "23503")
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    owner_ref: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    result_ref: Option<String>,
    discovered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner_ref: row.try_get("owner_ref")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            result_ref: row.try_get("result_ref")?,
            discovered_at: row.try_get("discovered_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| JobStoreError::Corrupt(format!("negative attempts on job {}", row.id)))?;

        let status: JobStatus = row.status.parse()?;
        if status.has_result() && row.result_ref.is_none() {
            return Err(JobStoreError::Corrupt(format!(
                "job {} is {status} without result_ref",
                row.id
            )));
        }

        Ok(Job {
            id: TokenId::try_from(row.id)?,
            owner_ref: OwnerRef::parse(&row.owner_ref)?,
            status,
            attempts,
            last_error: row.last_error,
            result_ref: row.result_ref,
            discovered_at: row.discovered_at,
            updated_at: row.updated_at,
        })
    }
}
