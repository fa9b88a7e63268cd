//! Scheduler loop: claim a batch, fan it out, wait for it to drain.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use mintforge_core::JobOutcome;

use super::processor::{JobProcessor, shutdown_requested};
use super::store::{JobStore, JobStoreError};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between polls (also after an empty batch)
    pub poll_interval: Duration,
    /// Maximum jobs claimed, and processed concurrently, per poll
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            name: "scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub polls: u64,
    pub jobs_claimed: u64,
    pub jobs_synthesized: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub commit_errors: u64,
    pub claim_errors: u64,
    pub uptime_secs: u64,
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub synthesized: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs whose outcome could not be written (or whose task panicked)
    pub commit_errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Synthesized { .. } => self.synthesized += 1,
            JobOutcome::Retry { .. } => self.retried += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

impl SchedulerStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.jobs_claimed += report.claimed as u64;
        self.jobs_synthesized += report.synthesized as u64;
        self.jobs_retried += report.retried as u64;
        self.jobs_failed += report.failed as u64;
        self.commit_errors += report.commit_errors as u64;
    }
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Stop claiming, wait for the in-flight batch to drain, then return.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "scheduler task ended abnormally");
            }
        }
    }

    /// Get current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Polls the job store and dispatches claimed jobs to the processor.
///
/// Several schedulers (in one process or many) may share a store; the
/// store's exclusive claim keeps them from processing the same job.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    processor: JobProcessor,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("processor", &self.processor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, processor: JobProcessor, config: SchedulerConfig) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    /// Spawn the scheduler loop on the tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let join = tokio::spawn(scheduler_loop(self, shutdown_rx, stats.clone()));

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Claim one batch and process it to completion.
    ///
    /// Jobs run concurrently; a fault or panic in one never affects its
    /// siblings. Returns only once every job in the batch has finished.
    pub async fn run_once(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchReport, JobStoreError> {
        let batch = self
            .store
            .claim_batch(self.config.batch_size, self.processor.max_attempts())
            .await?;

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        debug!(scheduler = %self.config.name, claimed = batch.len(), "claimed batch");

        let mut tasks = JoinSet::new();
        for claimed in batch {
            let processor = self.processor.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let id = claimed.job.id;
                (id, processor.process(claimed, shutdown).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(&outcome),
                Ok((id, Err(e))) => {
                    report.commit_errors += 1;
                    error!(
                        scheduler = %self.config.name,
                        job_id = %id,
                        error = %e,
                        "failed to commit job outcome"
                    );
                }
                Err(e) => {
                    report.commit_errors += 1;
                    error!(scheduler = %self.config.name, error = %e, "processor task panicked");
                }
            }
        }

        Ok(report)
    }
}

async fn scheduler_loop(
    scheduler: Scheduler,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    let name = scheduler.config.name.clone();
    info!(
        scheduler = %name,
        batch_size = scheduler.config.batch_size,
        poll_interval_ms = scheduler.config.poll_interval.as_millis() as u64,
        "scheduler started"
    );
    let start_time = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = scheduler.run_once(&shutdown).await;

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.polls += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(report) => s.absorb(report),
                Err(_) => s.claim_errors += 1,
            }
        }

        match result {
            Ok(report) if report.claimed > 0 => {
                info!(
                    scheduler = %name,
                    claimed = report.claimed,
                    synthesized = report.synthesized,
                    retried = report.retried,
                    failed = report.failed,
                    "batch drained"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(scheduler = %name, error = %e, "failed to claim batch");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(scheduler.config.poll_interval) => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    info!(scheduler = %name, "scheduler stopped");
}
