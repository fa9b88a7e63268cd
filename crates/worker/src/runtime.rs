//! Process runtime: wires the store, ledger and synthesis adapters into the
//! pipeline and implements the operator commands.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use mintforge_core::{Job, JobStatus, TokenId};
use mintforge_infra::jobs::{
    JobProcessor, JobStore, PostgresJobStore, RecoveryReport, Scheduler, recover_orphans,
};
use mintforge_infra::ledger::{JsonRpcLedger, Ledger, RetryingLedger};
use mintforge_infra::synthesis::{HttpSynthesizer, Synthesizer};
use mintforge_infra::{GapReconciler, IngestionListener, ReconcileOptions, ReconcileReport};

use crate::cli::{Cli, Command, RecoverArgs, ResetFailedArgs};
use crate::config::{PipelineConfig, StoreConfig, WorkerConfig, ledger_config_from_env};
use crate::webhook;

/// Dispatch a parsed command line.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run => run(WorkerConfig::from_env()?).await,
        Command::Recover(args) => {
            let store = connect_store(&StoreConfig::from_env()?).await?;
            let ledger = RetryingLedger::new(JsonRpcLedger::new(ledger_config_from_env()?)?);
            let report = recover(Arc::new(ledger), store, &args).await?;
            print_json(&report)
        }
        Command::ResetFailed(args) => {
            let config = StoreConfig::from_env()?;
            let store = connect_store(&config).await?;
            let report = reset_failed(&*store, &args, config.max_attempts).await?;
            print_json(&report)
        }
        Command::ListFailed(args) => {
            let store = connect_store(&StoreConfig::from_env()?).await?;
            let jobs = list_failed(&*store, args.limit).await?;
            print_json(&jobs)
        }
        Command::Stats => {
            let store = connect_store(&StoreConfig::from_env()?).await?;
            let stats = store.stats().await.context("failed to read job counts")?;
            print_json(&stats)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<PostgresJobStore>> {
    let store = PostgresJobStore::connect(&config.database_url, config.max_connections)
        .await
        .context("failed to connect to the job store")?;
    store
        .migrate()
        .await
        .context("failed to apply job store migrations")?;
    Ok(Arc::new(store))
}

/// `mintforge run` against Postgres and the HTTP adapters.
pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let store = connect_store(&config.store).await?;
    let ledger = RetryingLedger::new(JsonRpcLedger::new(config.ledger)?);
    let synthesizer = HttpSynthesizer::new(config.synthesis)?;

    run_pipeline(
        store,
        Arc::new(ledger),
        Arc::new(synthesizer),
        config.pipeline,
        shutdown_signal(),
    )
    .await
}

/// Run the pipeline until `shutdown` resolves.
///
/// Startup order: orphan recovery, one reconciliation pass, then the
/// scheduler and the optional periodic reconciler and webhook. A failed
/// startup reconciliation is logged and the worker carries on with the
/// jobs it already knows about.
pub async fn run_pipeline(
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    synthesizer: Arc<dyn Synthesizer>,
    config: PipelineConfig,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let max_attempts = config.processor.retry.max_attempts;

    let recovery = recover_orphans(&*store, max_attempts)
        .await
        .context("startup orphan recovery failed")?;
    log_stuck(&recovery);

    let reconciler = GapReconciler::new(ledger, store.clone());
    if let Err(e) = reconciler.reconcile(ReconcileOptions::default()).await {
        warn!(error = %e, "startup reconciliation failed; continuing with known jobs");
    }

    let webhook_listener = match config.webhook_bind {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind webhook listener on {addr}"))?,
        ),
        None => None,
    };

    let processor = JobProcessor::new(store.clone(), synthesizer, config.processor);
    let scheduler = Scheduler::new(store.clone(), processor, config.scheduler).spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut background = JoinSet::new();

    if let Some(interval) = config.reconcile_interval {
        let reconciler = reconciler.clone();
        let stop = stop_rx.clone();
        background.spawn(async move { reconciler.run_periodic(interval, stop).await });
    }

    if let Some(listener) = webhook_listener {
        let app = webhook::router(IngestionListener::new(store.clone()));
        let stop = stop_rx.clone();
        background.spawn(async move {
            if let Err(e) = webhook::serve(listener, app, stop).await {
                error!(error = %e, "webhook server failed");
            }
        });
    }

    shutdown.await;
    info!("shutdown requested; draining in-flight jobs");

    let _ = stop_tx.send(true);
    scheduler.shutdown().await;
    while let Some(joined) = background.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "background task ended abnormally");
        }
    }

    info!("worker stopped");
    Ok(())
}

fn log_stuck(recovery: &RecoveryReport) {
    if !recovery.stuck.is_empty() {
        warn!(
            stuck = recovery.stuck.len(),
            "claimed jobs at the retry budget need `mintforge reset-failed`"
        );
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// `mintforge recover`: one reconciliation pass on demand.
pub async fn recover(
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn JobStore>,
    args: &RecoverArgs,
) -> anyhow::Result<ReconcileReport> {
    let report = GapReconciler::new(ledger, store)
        .reconcile(ReconcileOptions {
            limit: args.limit,
            dry_run: args.dry_run,
        })
        .await?;
    Ok(report)
}

/// What `mintforge reset-failed` did (or would do).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub dry_run: bool,
    pub jobs: Vec<TokenId>,
}

pub async fn reset_failed(
    store: &dyn JobStore,
    args: &ResetFailedArgs,
    max_attempts: u32,
) -> anyhow::Result<ResetReport> {
    let jobs = if args.dry_run {
        store
            .list_resettable(&args.ids, args.limit, max_attempts)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect()
    } else {
        let reset = store
            .reset_for_retry(&args.ids, args.limit, max_attempts)
            .await?;
        info!(reset = reset.len(), "jobs_reset");
        reset
    };

    Ok(ResetReport {
        dry_run: args.dry_run,
        jobs,
    })
}

pub async fn list_failed(store: &dyn JobStore, limit: usize) -> anyhow::Result<Vec<Job>> {
    Ok(store.list_by_status(JobStatus::Failed, limit).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mintforge_core::{JobOutcome, OwnerRef};
    use mintforge_infra::jobs::{InMemoryJobStore, NewJob, SchedulerConfig};
    use mintforge_infra::ledger::InMemoryLedger;
    use mintforge_infra::synthesis::ScriptedSynthesizer;
    use tokio::sync::oneshot;

    fn token(n: u64) -> TokenId {
        TokenId::new(n).unwrap()
    }

    fn owner(n: u64) -> OwnerRef {
        OwnerRef::parse(&format!("0x{:040x}", n)).unwrap()
    }

    async fn failed_job(store: &InMemoryJobStore, n: u64) {
        store.insert_job(NewJob::new(token(n), owner(n))).await.unwrap();
        store.claim_batch(1, 3).await.unwrap();
        store
            .commit_outcome(token(n), &JobOutcome::failed(0, "HTTP 400: bad prompt"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reset_failed_dry_run_changes_nothing() {
        let store = InMemoryJobStore::new();
        failed_job(&store, 1).await;
        failed_job(&store, 2).await;

        let args = ResetFailedArgs {
            ids: vec![],
            limit: 100,
            dry_run: true,
        };
        let report = reset_failed(&store, &args, 3).await.unwrap();
        assert_eq!(report.jobs, vec![token(1), token(2)]);
        assert_eq!(store.stats().await.unwrap().failed, 2);

        let args = ResetFailedArgs {
            ids: vec![token(2)],
            dry_run: false,
            ..args
        };
        let report = reset_failed(&store, &args, 3).await.unwrap();
        assert_eq!(report.jobs, vec![token(2)]);

        let job = store.get(token(2)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(list_failed(&store, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recover_reports_the_gap() {
        let ledger = InMemoryLedger::new();
        for n in 1..=4 {
            ledger.mint(token(n), owner(n));
        }
        let store = InMemoryJobStore::arc();

        let report = recover(
            Arc::new(ledger),
            store.clone(),
            &RecoverArgs {
                limit: None,
                dry_run: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.created, 4);
        assert_eq!(store.stats().await.unwrap().pending, 4);
    }

    #[tokio::test]
    async fn pipeline_synthesizes_reconciled_jobs_then_stops() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryJobStore::arc();
        for n in 1..=3 {
            ledger.mint(token(n), owner(n));
            store
                .set_owner_prompt(&owner(n), format!("a lighthouse, variant {n}"))
                .unwrap();
        }

        let config = PipelineConfig {
            scheduler: SchedulerConfig::default().with_poll_interval(Duration::from_millis(10)),
            ..PipelineConfig::from_lookup(|_| None).unwrap()
        };
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let pipeline = tokio::spawn(run_pipeline(
            store.clone(),
            Arc::new(ledger),
            Arc::new(ScriptedSynthesizer::new()),
            config,
            async move {
                let _ = stop_rx.await;
            },
        ));

        let mut uploaded = 0;
        for _ in 0..200 {
            uploaded = store.stats().await.unwrap().uploading;
            if uploaded == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(uploaded, 3);

        stop_tx.send(()).unwrap();
        pipeline.await.unwrap().unwrap();

        let job = store.get(token(2)).await.unwrap().unwrap();
        assert!(job.result_ref.is_some());
    }
}
