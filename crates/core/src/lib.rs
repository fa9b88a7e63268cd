//! `mintforge-core`: domain building blocks for the token processing pipeline.
//!
//! This crate contains **pure domain** logic (no IO): identifiers, the job
//! lifecycle, the synthesis fault taxonomy and the retry policy.

pub mod error;
pub mod fault;
pub mod id;
pub mod job;
pub mod prompt;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use fault::{FaultClass, SynthesisFault, classify};
pub use id::{OwnerRef, TokenId};
pub use job::{Job, JobOutcome, JobStatus, LAST_ERROR_MAX_CHARS, MAX_ATTEMPTS, truncate_error};
pub use prompt::{MAX_PROMPT_CHARS, validate_prompt};
pub use retry::{BackoffStrategy, FaultDecision, RetryPolicy};
