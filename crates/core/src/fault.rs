//! Synthesis fault taxonomy.
//!
//! Adapters map every underlying failure (HTTP status, transport error, SDK
//! error) into [`SynthesisFault`] at the boundary; the rest of the pipeline only
//! ever looks at this closed set and its [`FaultClass`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure raised by the remote synthesis adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SynthesisFault {
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("content policy rejection: {0}")]
    ContentRejected(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("unrecognized fault: {0}")]
    Unknown(String),
}

/// Retry class of a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// May succeed if retried unchanged.
    Transient,
    /// The input itself was rejected by remote moderation.
    ContentPolicy,
    /// Will not succeed without external intervention.
    Permanent,
}

impl FaultClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultClass::Transient => "transient",
            FaultClass::ContentPolicy => "content_policy",
            FaultClass::Permanent => "permanent",
        }
    }
}

impl core::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a fault to its retry class.
///
/// Priority: auth and malformed requests are permanent, then moderation, then
/// the transient family. Anything unrecognized is permanent so an unknown fault
/// never burns the retry budget.
pub fn classify(fault: &SynthesisFault) -> FaultClass {
    match fault {
        SynthesisFault::Unauthorized(_) | SynthesisFault::InvalidRequest(_) => FaultClass::Permanent,
        SynthesisFault::ContentRejected(_) => FaultClass::ContentPolicy,
        SynthesisFault::Timeout(_) | SynthesisFault::RateLimited(_) | SynthesisFault::Unavailable(_) => {
            FaultClass::Transient
        }
        SynthesisFault::Unknown(_) => FaultClass::Permanent,
    }
}
