//! Per-job state machine.
//!
//! The processor takes one claimed job, runs it through synthesis and commits
//! exactly one outcome. Faults are absorbed into that outcome; the only error
//! it returns is a failure to write the outcome back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use mintforge_core::{
    FaultClass, FaultDecision, Job, JobOutcome, RetryPolicy, SynthesisFault, classify,
    validate_prompt,
};

use super::store::{AuditEvent, ClaimedJob, JobStore, JobStoreError};
use crate::synthesis::{SynthesisRequest, Synthesizer};

/// Rendered in place of a prompt rejected by remote moderation.
pub const DEFAULT_FALLBACK_PROMPT: &str =
    "An abstract composition of soft geometric shapes in calm pastel colors";

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Model selector passed to the synthesizer
    pub model: String,
    /// Prompt used for the single in-process retry after a moderation rejection
    pub fallback_prompt: String,
    /// Upper bound on one synthesis call
    pub synthesis_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            model: "dall-e-3".to_string(),
            fallback_prompt: DEFAULT_FALLBACK_PROMPT.to_string(),
            synthesis_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_fallback_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.fallback_prompt = prompt.into();
        self
    }

    pub fn with_synthesis_timeout(mut self, timeout: Duration) -> Self {
        self.synthesis_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Runs claimed jobs through synthesis.
#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    synthesizer: Arc<dyn Synthesizer>,
    config: ProcessorConfig,
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        synthesizer: Arc<dyn Synthesizer>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            synthesizer,
            config,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.retry.max_attempts
    }

    /// Process one claimed job and commit its outcome.
    ///
    /// A retryable fault waits out its backoff before the job is returned to
    /// `pending`; a shutdown signal cuts that wait short.
    #[instrument(
        skip(self, claimed, shutdown),
        fields(job_id = %claimed.job.id, attempts = claimed.job.attempts),
        err
    )]
    pub async fn process(
        &self,
        claimed: ClaimedJob,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JobOutcome, JobStoreError> {
        let job = claimed.job;

        let outcome = match self.evaluate(&job, claimed.prompt.as_deref()).await {
            Ok(result_ref) => JobOutcome::synthesized(result_ref),
            Err(decision) => {
                if let FaultDecision::RetryAfter { delay, .. } = &decision {
                    tokio::select! {
                        _ = tokio::time::sleep(*delay) => {}
                        _ = shutdown_requested(&mut shutdown) => {
                            info!(job_id = %job.id, "shutdown during backoff; releasing job early");
                        }
                    }
                }
                decision.into_outcome()
            }
        };

        let committed = self.store.commit_outcome(job.id, &outcome).await?;

        match &outcome {
            JobOutcome::Synthesized { result_ref } => {
                info!(job_id = %job.id, result_ref = %result_ref, "job synthesized");
            }
            JobOutcome::Retry { last_error, .. } => {
                warn!(
                    job_id = %job.id,
                    attempts = committed.attempts,
                    error = %last_error,
                    "job returned to pending"
                );
            }
            JobOutcome::Failed { last_error, .. } => {
                error!(
                    job_id = %job.id,
                    attempts = committed.attempts,
                    error = %last_error,
                    "job failed"
                );
            }
        }

        Ok(outcome)
    }

    /// Synthesize the job's artifact, or decide what to do about the fault.
    async fn evaluate(&self, job: &Job, prompt: Option<&str>) -> Result<String, FaultDecision> {
        let prompt = match validate_prompt(prompt.unwrap_or_default()) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "prompt rejected before synthesis");
                return Err(self.config.retry.decide(
                    job.attempts,
                    FaultClass::Permanent,
                    &e.to_string(),
                ));
            }
        };

        let fault = match self.synthesize(prompt).await {
            Ok(result_ref) => return Ok(result_ref),
            Err(fault) => fault,
        };

        match classify(&fault) {
            FaultClass::ContentPolicy => self.retry_with_fallback(job, prompt, fault).await,
            class => {
                warn!(job_id = %job.id, class = %class, error = %fault, "synthesis failed");
                Err(self.config.retry.decide(job.attempts, class, &fault.to_string()))
            }
        }
    }

    /// Audit the rejected prompt, then retry once with the fallback prompt.
    ///
    /// The first rejection does not consume an attempt. A failed fallback is
    /// charged as a transient fault unless it is itself permanent.
    async fn retry_with_fallback(
        &self,
        job: &Job,
        original_prompt: &str,
        fault: SynthesisFault,
    ) -> Result<String, FaultDecision> {
        warn!(job_id = %job.id, error = %fault, "content_policy_rejection");

        let event = AuditEvent::content_policy_rejection(job.id, original_prompt);
        if let Err(e) = self.store.record_audit(&event).await {
            error!(job_id = %job.id, error = %e, "failed to record moderation audit event");
        }

        match self.synthesize(&self.config.fallback_prompt).await {
            Ok(result_ref) => {
                info!(job_id = %job.id, "fallback prompt accepted");
                Ok(result_ref)
            }
            Err(second) => {
                let class = match classify(&second) {
                    FaultClass::Permanent => FaultClass::Permanent,
                    _ => FaultClass::Transient,
                };
                warn!(job_id = %job.id, class = %class, error = %second, "fallback prompt failed");
                Err(self.config.retry.decide(
                    job.attempts,
                    class,
                    &format!("content policy fallback failed: {second}"),
                ))
            }
        }
    }

    async fn synthesize(&self, prompt: &str) -> Result<String, SynthesisFault> {
        let request = SynthesisRequest {
            prompt,
            model: &self.config.model,
        };
        let timeout = self.config.synthesis_timeout;

        match tokio::time::timeout(timeout, self.synthesizer.synthesize(request)).await {
            Ok(result) => result,
            Err(_) => Err(SynthesisFault::Timeout(format!(
                "no response within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// Resolve once shutdown has been signalled.
///
/// A dropped sender never signals; callers keep waiting on their other branch.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, NewJob};
    use crate::synthesis::ScriptedSynthesizer;
    use mintforge_core::{JobStatus, OwnerRef, TokenId};

    fn owner() -> OwnerRef {
        OwnerRef::parse("0x00000000000000000000000000000000000000aa").unwrap()
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_fallback_prompt("a calm abstract fallback")
            .with_retry_policy(RetryPolicy::exponential(
                3,
                Duration::from_millis(1),
                Duration::from_millis(4),
            ))
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        synth: Arc<ScriptedSynthesizer>,
        processor: JobProcessor,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    impl Harness {
        fn new(synth: ScriptedSynthesizer, config: ProcessorConfig) -> Self {
            let store = InMemoryJobStore::arc();
            let synth = Arc::new(synth);
            let processor = JobProcessor::new(store.clone(), synth.clone(), config);
            let (tx, rx) = watch::channel(false);
            Self {
                store,
                synth,
                processor,
                shutdown_tx: tx,
                shutdown_rx: rx,
            }
        }

        /// Seed job 1 with `attempts` and `prompt`, then claim it.
        async fn claimed(&self, attempts: u32, prompt: Option<&str>) -> ClaimedJob {
            let id = TokenId::new(1).unwrap();
            self.store.insert_job(NewJob::new(id, owner())).await.unwrap();
            if let Some(prompt) = prompt {
                self.store.set_owner_prompt(&owner(), prompt).unwrap();
            }
            if attempts > 0 {
                let mut job = self.store.get(id).await.unwrap().unwrap();
                job.attempts = attempts;
                self.store.put_job(job).unwrap();
            }
            self.store.claim_batch(1, 3).await.unwrap().remove(0)
        }

        async fn run(&self, claimed: ClaimedJob) -> Job {
            let id = claimed.job.id;
            self.processor
                .process(claimed, self.shutdown_rx.clone())
                .await
                .unwrap();
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn success_moves_job_to_uploading() {
        let synth = ScriptedSynthesizer::new();
        synth.push_ok("https://cdn.example/1.png");
        let h = Harness::new(synth, fast_config());

        let job = h.run(h.claimed(0, Some("a red fox")).await).await;

        assert_eq!(job.status, JobStatus::Uploading);
        assert_eq!(job.result_ref.as_deref(), Some("https://cdn.example/1.png"));
        assert!(job.last_error.is_none());
        assert_eq!(h.synth.prompts(), vec!["a red fox"]);
    }

    #[tokio::test]
    async fn rate_limit_returns_job_to_pending() {
        let synth = ScriptedSynthesizer::new();
        synth.push_fault(SynthesisFault::RateLimited("slow down".into()));
        let h = Harness::new(synth, fast_config());

        let job = h.run(h.claimed(0, Some("a red fox")).await).await;

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("rate limit"));
    }

    #[tokio::test]
    async fn transient_fault_at_budget_fails_job() {
        let synth = ScriptedSynthesizer::new();
        synth.push_fault(SynthesisFault::Unavailable("503".into()));
        let h = Harness::new(synth, fast_config());

        let job = h.run(h.claimed(2, Some("a red fox")).await).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.last_error.unwrap().starts_with("max retries exceeded"));
    }

    #[tokio::test]
    async fn moderation_rejection_audits_and_uses_fallback() {
        let synth = ScriptedSynthesizer::new();
        synth
            .push_fault(SynthesisFault::ContentRejected("safety system".into()))
            .push_ok("https://cdn.example/fallback.png");
        let h = Harness::new(synth, fast_config());

        let job = h.run(h.claimed(0, Some("something edgy")).await).await;

        assert_eq!(job.status, JobStatus::Uploading);
        assert_eq!(job.attempts, 0);
        assert_eq!(h.synth.prompts(), vec!["something edgy", "a calm abstract fallback"]);

        let audit = h.store.audit_events().unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].detail, "something edgy");
    }

    #[tokio::test]
    async fn failed_fallback_is_charged_as_transient() {
        let synth = ScriptedSynthesizer::new();
        synth
            .push_fault(SynthesisFault::ContentRejected("safety system".into()))
            .push_fault(SynthesisFault::ContentRejected("still no".into()));
        let h = Harness::new(synth, fast_config());

        let job = h.run(h.claimed(0, Some("something edgy")).await).await;

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().starts_with("content policy fallback failed"));
        assert_eq!(h.synth.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_fault_keeps_attempts() {
        let synth = ScriptedSynthesizer::new();
        synth.push_fault(SynthesisFault::Unauthorized("bad key".into()));
        let h = Harness::new(synth, fast_config());

        let job = h.run(h.claimed(1, Some("a red fox")).await).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("authentication failed"));
    }

    #[tokio::test]
    async fn invalid_prompt_fails_without_remote_call() {
        let h = Harness::new(ScriptedSynthesizer::new(), fast_config());

        let job = h.run(h.claimed(0, None).await).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.unwrap().contains("prompt is empty"));
        assert_eq!(h.synth.calls(), 0);
    }

    #[tokio::test]
    async fn oversized_prompt_fails_without_remote_call() {
        let h = Harness::new(ScriptedSynthesizer::new(), fast_config());
        let prompt = "x".repeat(1001);

        let job = h.run(h.claimed(0, Some(&prompt)).await).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.synth.calls(), 0);
    }

    #[tokio::test]
    async fn slow_synthesis_times_out_as_transient() {
        let synth = ScriptedSynthesizer::new().with_delay(Duration::from_millis(500));
        let h = Harness::new(
            synth,
            fast_config().with_synthesis_timeout(Duration::from_millis(20)),
        );

        let job = h.run(h.claimed(0, Some("a red fox")).await).await;

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn shutdown_cuts_backoff_short() {
        let synth = ScriptedSynthesizer::new();
        synth.push_fault(SynthesisFault::RateLimited("slow down".into()));
        let config = fast_config().with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60)));
        let h = Harness::new(synth, config);
        h.shutdown_tx.send(true).unwrap();

        let claimed = h.claimed(0, Some("a red fox")).await;
        let job = tokio::time::timeout(Duration::from_secs(5), h.run(claimed))
            .await
            .expect("backoff should end on shutdown");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }
}
