//! Synthesis job pipeline: storage, claiming, processing, recovery.
//!
//! ## Components
//!
//! - `JobStore`: durable job table with exclusive claiming (in-memory or Postgres)
//! - `JobProcessor`: runs one claimed job through synthesis and commits the outcome
//! - `Scheduler`: polls for pending jobs and fans a batch out to the processor
//! - `recover_orphans`: startup pass that returns crashed claims to `pending`

pub mod postgres;
pub mod processor;
pub mod recovery;
pub mod scheduler;
pub mod store;

pub use postgres::PostgresJobStore;
pub use processor::{DEFAULT_FALLBACK_PROMPT, JobProcessor, ProcessorConfig};
pub use recovery::{RecoveryReport, recover_orphans};
pub use scheduler::{BatchReport, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
pub use store::{
    AuditEvent, AuditKind, ClaimedJob, InMemoryJobStore, InsertOutcome, JobStats, JobStore,
    JobStoreError, NewJob, insert_job_idempotent,
};
