//! Remote synthesis adapters.
//!
//! Every adapter maps its failures into [`SynthesisFault`] before returning;
//! nothing above this module sees an HTTP status or a transport error.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use mintforge_core::SynthesisFault;

pub mod http;

pub use http::{HttpSynthesizer, HttpSynthesizerConfig};

/// One synthesis call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisRequest<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
}

/// Remote image synthesis.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render the prompt and return the location of the produced artifact.
    async fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<String, SynthesisFault>;
}

/// Synthesizer that replays a scripted sequence of results (tests/dev).
///
/// Once the script is exhausted every call succeeds with a
/// `memory://synthesized/<n>` location.
#[derive(Debug, Default)]
pub struct ScriptedSynthesizer {
    script: Mutex<VecDeque<Result<String, SynthesisFault>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, result_ref: impl Into<String>) -> &Self {
        self.push(Ok(result_ref.into()))
    }

    pub fn push_fault(&self, fault: SynthesisFault) -> &Self {
        self.push(Err(fault))
    }

    fn push(&self, result: Result<String, SynthesisFault>) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<String, SynthesisFault> {
        let call = {
            let mut prompts = self.prompts.lock().unwrap_or_else(PoisonError::into_inner);
            prompts.push(request.prompt.to_string());
            prompts.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| Ok(format!("memory://synthesized/{call}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_succeeds() {
        let synth = ScriptedSynthesizer::new();
        synth
            .push_fault(SynthesisFault::RateLimited("slow down".into()))
            .push_ok("ipfs://first");

        let req = SynthesisRequest {
            prompt: "a fox",
            model: "m",
        };
        assert!(matches!(
            synth.synthesize(req).await,
            Err(SynthesisFault::RateLimited(_))
        ));
        assert_eq!(synth.synthesize(req).await.unwrap(), "ipfs://first");
        assert_eq!(synth.synthesize(req).await.unwrap(), "memory://synthesized/3");
        assert_eq!(synth.prompts(), vec!["a fox"; 3]);
    }
}
