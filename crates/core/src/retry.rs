//! Retry policy and fault bookkeeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fault::FaultClass;
use crate::job::{JobOutcome, MAX_ATTEMPTS};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry budget (attempts are counted from 0 and never exceed this)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    /// Three attempts, 1s / 2s / 4s.
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// What to do with a job after a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultDecision {
    /// Wait `delay`, then return the job to `pending` with `attempts`.
    RetryAfter {
        attempts: u32,
        delay: Duration,
        last_error: String,
    },
    /// Move the job to `failed`.
    Fail { attempts: u32, last_error: String },
}

impl FaultDecision {
    /// The outcome to commit once any backoff has elapsed.
    pub fn into_outcome(self) -> JobOutcome {
        match self {
            FaultDecision::RetryAfter {
                attempts,
                last_error,
                ..
            } => JobOutcome::retry(attempts, &last_error),
            FaultDecision::Fail {
                attempts,
                last_error,
            } => JobOutcome::failed(attempts, &last_error),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Decide the next step for a job that had `attempts` before this fault.
    ///
    /// `Permanent` fails without touching the counter. `Transient` and
    /// `ContentPolicy` (a rejected fallback prompt) consume one attempt; the
    /// attempt that reaches the budget fails the job instead of retrying.
    pub fn decide(&self, attempts: u32, class: FaultClass, error: &str) -> FaultDecision {
        match class {
            FaultClass::Permanent => FaultDecision::Fail {
                attempts,
                last_error: error.to_string(),
            },
            FaultClass::Transient | FaultClass::ContentPolicy => {
                let next = attempts.saturating_add(1).min(self.max_attempts.max(attempts));
                if self.should_retry(next) {
                    FaultDecision::RetryAfter {
                        attempts: next,
                        delay: self.delay_for_attempt(next),
                        last_error: error.to_string(),
                    }
                } else {
                    FaultDecision::Fail {
                        attempts: next,
                        last_error: format!("max retries exceeded: {error}"),
                    }
                }
            }
        }
    }
}
