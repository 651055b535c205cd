//! Subcommand implementations. Results go to stdout as JSON; logs go to stderr.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use vaultline_core::{ContentHash, JobId};
use vaultline_infra::jobs::JobState;
use vaultline_infra::{
    BatchOptions, BatchResult, IngestConfig, PipelineContext, PipelineRunner, ProgressStore, RunnerSettings,
    standard_stages,
};

use crate::input;

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open(config: &IngestConfig) -> Result<PipelineContext> {
    PipelineContext::open(config)
        .await
        .with_context(|| format!("opening pipeline state in {}", config.data_dir.display()))
}

/// Flip the returned receiver on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight stages");
            let _ = tx.send(true);
        }
    });
    rx
}

pub async fn ingest(
    config: &IngestConfig,
    input: &Path,
    concurrency: Option<usize>,
    force: bool,
) -> Result<()> {
    let records = input::read_records(input)?;
    let malformed = records.malformed();
    info!(input = %input.display(), "reading input");

    let ctx = open(config).await?;
    let stages = standard_stages(config)?;
    let runner = PipelineRunner::new(ctx, stages, RunnerSettings::from_config(config))?;

    let mut options = BatchOptions::default()
        .forced(force)
        .with_shutdown(shutdown_on_ctrl_c());
    if let Some(n) = concurrency {
        options = options.with_concurrency(n);
    }

    let result = runner.process_batch_with(records, options).await?;
    emit(&IngestReport {
        result,
        malformed: malformed.load(Ordering::Relaxed),
    })
}

#[derive(Serialize)]
struct IngestReport {
    #[serde(flatten)]
    result: BatchResult,
    /// Input lines skipped because they were not valid records.
    malformed: usize,
}

#[derive(Serialize)]
struct Status {
    queue: vaultline_infra::jobs::QueueStats,
    progress: vaultline_infra::progress::LedgerStats,
    rate_limits: Vec<vaultline_infra::rate_limit::ModelUsage>,
}

pub async fn status(config: &IngestConfig) -> Result<()> {
    let ctx = open(config).await?;
    emit(&Status {
        queue: ctx.queue.stats().await?,
        progress: ctx.ledger.stats(),
        rate_limits: ctx.limiter.snapshot(),
    })
}

pub async fn dead_letters(config: &IngestConfig, limit: usize) -> Result<()> {
    let ctx = open(config).await?;
    emit(&ctx.queue.dead_letters(limit).await?)
}

pub async fn requeue(config: &IngestConfig, job_id: JobId) -> Result<()> {
    let ctx = open(config).await?;
    let job = ctx
        .queue
        .requeue_dead(job_id)
        .await
        .with_context(|| format!("requeueing job {job_id}"))?;
    ctx.ledger.forget(&job.content_hash)?;
    info!(%job_id, hash = %job.content_hash.short(), "requeued");
    emit(&job)
}

pub async fn force(config: &IngestConfig, hash: &ContentHash) -> Result<()> {
    let ctx = open(config).await?;
    let forgotten = ctx.ledger.forget(hash)?;

    let requeued = match ctx.queue.find_by_hash(hash).await? {
        Some(job) if job.state == JobState::Dead => {
            ctx.queue.requeue_dead(job.id).await?;
            true
        }
        _ => false,
    };

    if !forgotten && !requeued {
        bail!("no progress entry or dead job for {hash}");
    }
    info!(hash = %hash.short(), forgotten, requeued, "content will be reprocessed");
    emit(&serde_json::json!({ "hash": hash, "forgotten": forgotten, "requeued": requeued }))
}

pub async fn reset(config: &IngestConfig, queue: bool, progress: bool) -> Result<()> {
    if !queue && !progress {
        bail!("nothing to reset; pass --queue and/or --progress");
    }
    let ctx = open(config).await?;

    let jobs = if queue { ctx.queue.clear().await? } else { 0 };
    let entries = if progress {
        let n = ctx.ledger.reset()?;
        ctx.progress.flush()?;
        n
    } else {
        0
    };

    warn!(jobs, entries, "state reset");
    emit(&serde_json::json!({ "jobs_removed": jobs, "progress_entries_removed": entries }))
}

pub async fn purge(config: &IngestConfig, days: u64) -> Result<()> {
    let ctx = open(config).await?;
    let removed = ctx
        .queue
        .purge_finished(Duration::from_secs(days * 24 * 3600))
        .await?;
    info!(removed, days, "purged finished jobs");
    emit(&serde_json::json!({ "jobs_removed": removed }))
}
