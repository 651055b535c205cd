//! Batch runner: feeds records into the queue and drains it with a bounded
//! worker pool, running every job through the stage set.
//!
//! ## Per-job flow
//!
//! 1. load the payload and validate it (failures dead-letter immediately)
//! 2. skip stage work if the ledger already has a success for the hash
//! 3. run the stages in order, acquiring the rate limiter before any stage
//!    that calls an upstream model
//! 4. all stages succeeded: record success in the ledger, then ack
//! 5. any stage failed: nack; a job that ends up dead is recorded as a
//!    failure in the ledger
//!
//! The ledger write precedes the ack, so a crash between the two leaves an
//! in-progress job whose hash is already recorded; it is acked without stage
//! work when its lease is reclaimed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use vaultline_core::{ContentHash, ConversationRecord, JobId, WorkerId};
use vaultline_stages::{StageData, StageSet};

use crate::config::{ConfigError, IngestConfig};
use crate::jobs::{EnqueueOutcome, Job, JobError, JobState, JobStoreError, QueueError};
use crate::progress::{EntryMeta, Outcome, ProgressStoreError};
use crate::rate_limit::RateLimitError;

use super::context::PipelineContext;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Progress(#[from] ProgressStoreError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid stage setup: {0}")]
    InvalidStages(String),
    #[error("worker failed: {0}")]
    Worker(String),
}

impl RunnerError {
    fn lost_lease(&self) -> Option<JobId> {
        match self {
            RunnerError::Queue(QueueError::Store(JobStoreError::LeaseLost(id))) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Default worker count when a batch does not name one.
    pub concurrency: usize,
    /// Upstream model requested for model-calling stages.
    pub model: String,
    pub lease: Duration,
    pub dequeue_timeout: Duration,
    /// How long in-flight jobs get to reach a stage boundary after shutdown.
    pub shutdown_grace: Duration,
    /// Longest rate-limit wait a worker sits through before releasing the job.
    pub max_rate_wait: Option<Duration>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            model: "gpt-4o".to_string(),
            lease: Duration::from_secs(300),
            dequeue_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            max_rate_wait: None,
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            concurrency: config.runner.concurrency,
            model: config.runner.model.clone(),
            lease: Duration::from_secs(config.queue.lease_secs),
            dequeue_timeout: Duration::from_millis(config.queue.dequeue_timeout_ms),
            shutdown_grace: Duration::from_secs(config.runner.shutdown_grace_secs),
            max_rate_wait: config.runner.max_rate_wait_secs.map(Duration::from_secs),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_rate_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_rate_wait = max_wait;
        self
    }
}

/// Per-batch knobs.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Overrides [`RunnerSettings::concurrency`].
    pub concurrency: Option<usize>,
    /// Reprocess content even if the ledger already has it.
    pub force: bool,
    /// Flip to `true` to stop the batch gracefully.
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl BatchOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

/// Counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// Jobs that ran every stage and were recorded as successful.
    pub processed: usize,
    /// Records (or jobs) whose content was already in the ledger.
    pub skipped: usize,
    /// Jobs that were dead-lettered during the batch.
    pub failed: usize,
    /// Jobs handed back to the queue unfinished (shutdown, long rate wait).
    pub released: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Processed,
    Skipped,
    Failed,
    Retrying,
    Released,
    Deferred,
    Lost,
}

struct Inner {
    ctx: PipelineContext,
    stages: StageSet,
    settings: RunnerSettings,
}

#[derive(Default)]
struct BatchState {
    processed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    released: AtomicUsize,
    /// Jobs this batch enqueued that have not reached an outcome yet.
    outstanding: AtomicUsize,
    producer_done: AtomicBool,
    halted: AtomicBool,
    progress: Notify,
    /// Released with a delay; they stay pending past the end of the batch.
    deferred: Mutex<HashSet<JobId>>,
    fatal: Mutex<Option<RunnerError>>,
}

impl BatchState {
    fn tally(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Processed => Some(&self.processed),
            JobOutcome::Skipped => Some(&self.skipped),
            JobOutcome::Failed => Some(&self.failed),
            JobOutcome::Released | JobOutcome::Deferred => Some(&self.released),
            JobOutcome::Retrying | JobOutcome::Lost => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        if outcome != JobOutcome::Retrying {
            let _ = self
                .outstanding
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            self.progress.notify_waiters();
        }
    }

    fn halt(&self, err: RunnerError) {
        error!(error = %err, "halting batch");
        self.halted.store(true, Ordering::SeqCst);
        self.fatal
            .lock()
            .expect("batch state lock poisoned")
            .get_or_insert(err);
        self.progress.notify_waiters();
    }

    fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn deferred_count(&self) -> usize {
        self.deferred.lock().expect("batch state lock poisoned").len()
    }

    fn result(&self) -> BatchResult {
        BatchResult {
            processed: self.processed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

/// Drives batches of records through the pipeline.
#[derive(Clone)]
pub struct PipelineRunner {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("stages", &self.inner.stages)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl PipelineRunner {
    pub fn new(
        ctx: PipelineContext,
        stages: StageSet,
        settings: RunnerSettings,
    ) -> Result<Self, RunnerError> {
        if stages.is_empty() {
            return Err(RunnerError::InvalidStages("no stages configured".into()));
        }
        if settings.concurrency == 0 {
            return Err(RunnerError::InvalidStages("concurrency must be at least 1".into()));
        }
        if stages.iter().any(|s| s.calls_model()) && !ctx.limiter.knows(&settings.model) {
            return Err(RateLimitError::UnknownModel(settings.model.clone()).into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                stages,
                settings,
            }),
        })
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.ctx
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.inner.settings
    }

    /// Process `records` with `concurrency` workers.
    pub async fn process_batch<I>(&self, records: I, concurrency: usize) -> Result<BatchResult, RunnerError>
    where
        I: IntoIterator<Item = ConversationRecord>,
    {
        self.process_batch_with(records, BatchOptions::default().with_concurrency(concurrency))
            .await
    }

    /// Process `records` lazily: each is hashed, checked against the ledger
    /// and enqueued while workers drain the queue. The input is consumed no
    /// faster than twice the worker count ahead of completed jobs.
    pub async fn process_batch_with<I>(
        &self,
        records: I,
        options: BatchOptions,
    ) -> Result<BatchResult, RunnerError>
    where
        I: IntoIterator<Item = ConversationRecord>,
    {
        let concurrency = options
            .concurrency
            .unwrap_or(self.inner.settings.concurrency)
            .max(1);
        let (_keepalive, default_rx) = watch::channel(false);
        let shutdown = options.shutdown.clone().unwrap_or(default_rx);
        let state = Arc::new(BatchState::default());
        let started = Instant::now();

        info!(concurrency, force = options.force, "batch started");

        let mut workers = JoinSet::new();
        for n in 0..concurrency {
            let inner = self.inner.clone();
            let state = state.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { inner.worker_loop(n, state, shutdown).await });
        }

        let high_water = concurrency * 2;
        if let Err(err) = self
            .inner
            .produce(records, options.force, high_water, &state, shutdown.clone())
            .await
        {
            state.halt(err);
        }
        state.producer_done.store(true, Ordering::SeqCst);
        state.progress.notify_waiters();

        self.drain(&mut workers, &state, shutdown).await;

        let ledger = self.inner.ctx.ledger.clone();
        match tokio::task::spawn_blocking(move || ledger.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => state.halt(err.into()),
            Err(e) => state.halt(RunnerError::Worker(format!("ledger flush panicked: {e}"))),
        }

        if let Some(err) = state.fatal.lock().expect("batch state lock poisoned").take() {
            return Err(err);
        }

        let result = state.result();
        info!(
            processed = result.processed,
            skipped = result.skipped,
            failed = result.failed,
            released = result.released,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(result)
    }

    /// Wait for the workers; after a shutdown signal give them
    /// `shutdown_grace` to reach a stage boundary, then abort the rest. Their
    /// leases expire and the jobs are reclaimed by a later run.
    async fn drain(
        &self,
        workers: &mut JoinSet<()>,
        state: &BatchState,
        mut shutdown: watch::Receiver<bool>,
    ) {
        enum Event {
            Joined(Option<Result<(), tokio::task::JoinError>>),
            Shutdown,
            GraceOver,
        }

        let mut deadline: Option<Instant> = None;
        loop {
            let current = deadline;
            let grace_over = async move {
                match current {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let event = tokio::select! {
                joined = workers.join_next() => Event::Joined(joined),
                _ = shutdown_signalled(&mut shutdown), if deadline.is_none() => Event::Shutdown,
                _ = grace_over => Event::GraceOver,
            };

            match event {
                Event::Joined(None) => break,
                Event::Joined(Some(Err(e))) if e.is_panic() => {
                    state.halt(RunnerError::Worker(e.to_string()));
                }
                Event::Joined(Some(_)) => {}
                Event::Shutdown => {
                    info!(
                        in_flight = workers.len(),
                        grace_secs = self.inner.settings.shutdown_grace.as_secs(),
                        "shutdown requested; waiting for in-flight jobs"
                    );
                    deadline = Some(Instant::now() + self.inner.settings.shutdown_grace);
                }
                Event::GraceOver => {
                    warn!(remaining = workers.len(), "shutdown grace elapsed; abandoning in-flight jobs");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}

impl Inner {
    /// Record a terminal outcome. The progress store rewrites and syncs its
    /// file, so the write runs on the blocking pool.
    async fn commit(
        &self,
        hash: &ContentHash,
        meta: EntryMeta,
        outcome: Outcome,
    ) -> Result<bool, RunnerError> {
        let ledger = self.ctx.ledger.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || ledger.record(&hash, &meta, outcome))
            .await
            .map_err(|e| RunnerError::Worker(format!("ledger write panicked: {e}")))?
            .map_err(RunnerError::from)
    }

    async fn produce<I>(
        &self,
        records: I,
        force: bool,
        high_water: usize,
        state: &BatchState,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), RunnerError>
    where
        I: IntoIterator<Item = ConversationRecord>,
    {
        let queue = &self.ctx.queue;
        let ledger = &self.ctx.ledger;
        let mut seen = HashSet::new();

        for record in records {
            if *shutdown.borrow() || state.halted() {
                info!("no longer accepting records");
                break;
            }

            let hash = record.content_hash();
            if !seen.insert(hash.clone()) {
                debug!(source_id = %record.id, hash = %hash.short(), "repeated within batch; skipping");
                state.skipped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            if !force && ledger.exists(&hash) {
                debug!(source_id = %record.id, hash = %hash.short(), "already in ledger; skipping");
                state.skipped.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            match queue.enqueue(&hash, &record, force).await {
                Ok(EnqueueOutcome::Created(_)) => {}
                Ok(EnqueueOutcome::Duplicate(id)) => {
                    debug!(job_id = %id, source_id = %record.id, "already queued by an earlier run");
                    continue;
                }
                Err(QueueError::AlreadyDone(_)) => {
                    warn!(
                        source_id = %record.id,
                        hash = %hash.short(),
                        "queue finished this content but the ledger has no entry; reprocessing"
                    );
                    queue.enqueue(&hash, &record, true).await?;
                }
                Err(QueueError::AlreadyDead(_)) => {
                    let summary = queue
                        .find_by_hash(&hash)
                        .await?
                        .and_then(|job| job.last_error)
                        .map(|e| e.summary())
                        .unwrap_or_else(|| "dead-lettered".to_string());
                    self.commit(
                        &hash,
                        EntryMeta::new(record.id.clone(), record.title.clone()),
                        Outcome::Failure(summary),
                    )
                    .await?;
                    warn!(source_id = %record.id, hash = %hash.short(), "dead-lettered content was missing from the ledger");
                    state.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            state.outstanding.fetch_add(1, Ordering::SeqCst);
            while state.outstanding.load(Ordering::SeqCst) >= high_water
                && !*shutdown.borrow()
                && !state.halted()
            {
                tokio::select! {
                    _ = state.progress.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }
        Ok(())
    }

    async fn worker_loop(&self, n: usize, state: Arc<BatchState>, mut shutdown: watch::Receiver<bool>) {
        let worker = WorkerId::new();
        debug!(worker = n, %worker, "worker started");

        loop {
            if *shutdown.borrow() || state.halted() {
                break;
            }

            let job = match self
                .ctx
                .queue
                .dequeue(worker, self.settings.lease, self.settings.dequeue_timeout)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => match self.idle(&state).await {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(err) => {
                        state.halt(err);
                        break;
                    }
                },
                Err(err) => {
                    state.halt(err.into());
                    break;
                }
            };

            state
                .deferred
                .lock()
                .expect("batch state lock poisoned")
                .remove(&job.id);

            let span = info_span!(
                "job",
                job_id = %job.id,
                hash = %job.content_hash.short(),
                worker = n
            );
            let outcome = match self
                .handle(worker, job, &state, &mut shutdown)
                .instrument(span)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => match err.lost_lease() {
                    Some(id) => {
                        warn!(job_id = %id, %worker, "lease lost; another worker owns the job now");
                        JobOutcome::Lost
                    }
                    None => {
                        state.halt(err);
                        break;
                    }
                },
            };
            state.tally(outcome);
        }
        debug!(worker = n, "worker stopped");
    }

    /// Nothing left for this batch: input exhausted and every remaining
    /// active job is one we deliberately deferred.
    async fn idle(&self, state: &BatchState) -> Result<bool, RunnerError> {
        if !state.producer_done.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let stats = self.ctx.queue.stats().await?;
        Ok(stats.active() <= state.deferred_count())
    }

    async fn handle(
        &self,
        worker: WorkerId,
        job: Job,
        state: &BatchState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<JobOutcome, RunnerError> {
        let queue = &self.ctx.queue;

        let Some(record) = queue.payload(job.id).await? else {
            let error = JobError::new("load", "job payload is missing", false);
            return self.fail(worker, &job, "", error).await;
        };

        if let Err(e) = record.validate() {
            let error = JobError::new("validate", e.to_string(), false);
            return self.fail(worker, &job, &record.title, error).await;
        }

        if !job.forced && self.ctx.ledger.is_done(&job.content_hash) {
            queue.ack(job.id, worker).await?;
            info!("already recorded as processed; acked without stage work");
            return Ok(JobOutcome::Skipped);
        }

        let title = record.title.clone();
        let mut data = StageData::new(job.content_hash.clone(), record);

        for stage in self.stages.iter() {
            if *shutdown.borrow() {
                queue.release(job.id, worker, Duration::ZERO).await?;
                info!(next_stage = stage.name(), "released at stage boundary for shutdown");
                return Ok(JobOutcome::Released);
            }

            if stage.calls_model() {
                match self
                    .ctx
                    .limiter
                    .acquire(&self.settings.model, self.settings.max_rate_wait, shutdown)
                    .await
                {
                    Ok(model) => data.model = Some(model),
                    Err(RateLimitError::Cancelled) => {
                        queue.release(job.id, worker, Duration::ZERO).await?;
                        info!(stage = stage.name(), "released while waiting for rate limit");
                        return Ok(JobOutcome::Released);
                    }
                    Err(RateLimitError::WaitExceeded { model, wait }) => {
                        queue.release(job.id, worker, wait).await?;
                        state
                            .deferred
                            .lock()
                            .expect("batch state lock poisoned")
                            .insert(job.id);
                        info!(%model, wait_secs = wait.as_secs(), "rate limit wait too long; deferred");
                        return Ok(JobOutcome::Deferred);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let started = Instant::now();
            data = match stage.transform(data).await {
                Ok(next) => next,
                Err(e) => {
                    let error = JobError::new(stage.name(), e.to_string(), e.is_retryable());
                    return self.fail(worker, &job, &title, error).await;
                }
            };
            debug!(
                stage = stage.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage complete"
            );
        }

        let meta = EntryMeta::new(job.source_id.clone(), data.record.title.clone());
        self.commit(&job.content_hash, meta, Outcome::Success).await?;
        queue.ack(job.id, worker).await?;
        info!(
            redactions = data.total_redactions(),
            model = data.model.as_deref().unwrap_or("-"),
            "job processed"
        );
        Ok(JobOutcome::Processed)
    }

    async fn fail(
        &self,
        worker: WorkerId,
        job: &Job,
        title: &str,
        error: JobError,
    ) -> Result<JobOutcome, RunnerError> {
        let updated = self.ctx.queue.nack(job.id, worker, error.clone()).await?;

        if updated.state != JobState::Dead {
            warn!(
                stage = %error.stage,
                error = %error.message,
                attempt = updated.attempt_count,
                retry_at = %updated.available_at,
                "stage failed; will retry"
            );
            return Ok(JobOutcome::Retrying);
        }

        self.commit(
            &job.content_hash,
            EntryMeta::new(job.source_id.clone(), title),
            Outcome::Failure(error.summary()),
        )
        .await?;
        error!(
            job_id = %job.id,
            hash = %job.content_hash,
            stage = %error.stage,
            error = %error.message,
            attempts = updated.attempt_count,
            "job dead-lettered"
        );
        Ok(JobOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use vaultline_stages::{
        ExtractiveSummarizer, HashingEmbedder, MemoryIndex, Redactor, Stage, StageError,
        StageKind,
    };

    use crate::jobs::{QueueSettings, RetryPolicy};
    use crate::rate_limit::ModelLimit;

    fn record(n: usize) -> ConversationRecord {
        ConversationRecord::new(format!("conv-{n}"), format!("Planning session {n}"))
            .with_message("user", format!("We need to decide on the storage layer for service {n}."))
            .with_message("assistant", "We decided to use SQLite with WAL mode. Action: write the migration.")
    }

    fn limits() -> BTreeMap<String, ModelLimit> {
        BTreeMap::from([(
            "test-model".to_string(),
            ModelLimit::sliding(1000, Duration::from_secs(3600)),
        )])
    }

    fn settings() -> RunnerSettings {
        RunnerSettings::default()
            .with_model("test-model")
            .with_dequeue_timeout(Duration::from_millis(20))
    }

    async fn context(retry: RetryPolicy) -> PipelineContext {
        PipelineContext::in_memory(
            limits(),
            QueueSettings::default()
                .with_retry(retry)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .await
        .unwrap()
    }

    fn stages(index: Arc<MemoryIndex>) -> StageSet {
        StageSet::standard(
            Redactor::builtin().unwrap(),
            Arc::new(ExtractiveSummarizer::default()),
            Arc::new(HashingEmbedder::new(32)),
            index,
        )
    }

    struct FailingEmbed {
        error: StageError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Stage for FailingEmbed {
        fn kind(&self) -> StageKind {
            StageKind::Embed
        }

        async fn transform(&self, _input: StageData) -> Result<StageData, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    #[tokio::test]
    async fn processes_every_record_once() {
        let index = Arc::new(MemoryIndex::default());
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages(index.clone()), settings())
                .unwrap();

        let result = runner.process_batch((0..5).map(record), 2).await.unwrap();

        assert_eq!(result, BatchResult { processed: 5, ..Default::default() });
        assert_eq!(index.len(), 5);
        assert_eq!(index.total_writes(), 5);
        assert_eq!(runner.context().ledger.stats().succeeded, 5);
        assert_eq!(runner.context().queue.stats().await.unwrap().done, 5);
    }

    #[tokio::test]
    async fn rerun_skips_everything() {
        let index = Arc::new(MemoryIndex::default());
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages(index.clone()), settings())
                .unwrap();

        runner.process_batch((0..3).map(record), 2).await.unwrap();
        let again = runner.process_batch((0..3).map(record), 2).await.unwrap();

        assert_eq!(again, BatchResult { skipped: 3, ..Default::default() });
        assert_eq!(index.total_writes(), 3);
    }

    #[tokio::test]
    async fn forced_batch_reprocesses() {
        let index = Arc::new(MemoryIndex::default());
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages(index.clone()), settings())
                .unwrap();

        runner.process_batch((0..2).map(record), 1).await.unwrap();
        let forced = runner
            .process_batch_with((0..2).map(record), BatchOptions::default().forced(true))
            .await
            .unwrap();

        assert_eq!(forced.processed, 2);
        assert_eq!(index.writes(record(0).content_hash().as_str()), 2);
    }

    #[tokio::test]
    async fn duplicate_records_in_one_batch_run_once() {
        let index = Arc::new(MemoryIndex::default());
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages(index.clone()), settings())
                .unwrap();

        let input = vec![record(1), record(1), record(2)];
        let result = runner.process_batch(input, 1).await.unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(index.total_writes(), 2);
    }

    #[tokio::test]
    async fn invalid_record_is_dead_lettered_without_retry() {
        let index = Arc::new(MemoryIndex::default());
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages(index.clone()), settings())
                .unwrap();

        let empty = ConversationRecord::new("conv-empty", "No messages");
        let result = runner.process_batch(vec![empty.clone()], 1).await.unwrap();

        assert_eq!(result.failed, 1);
        let entry = runner.context().ledger.get(&empty.content_hash()).unwrap();
        assert!(!entry.success);
        assert!(entry.error_summary.unwrap().starts_with("validate:"));
        let dead = runner.context().queue.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].attempts, 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_dead() {
        let failing = Arc::new(FailingEmbed {
            error: StageError::transient("connection reset"),
            calls: AtomicUsize::new(0),
        });
        let stages = stages(Arc::new(MemoryIndex::default())).replace(failing.clone());
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages, settings()).unwrap();

        let result = runner.process_batch(vec![record(1)], 1).await.unwrap();

        assert_eq!(result, BatchResult { failed: 1, ..Default::default() });
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        let entry = runner.context().ledger.get(&record(1).content_hash()).unwrap();
        assert_eq!(entry.error_summary.as_deref(), Some("embed: transient failure: connection reset"));
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_up_front() {
        let err = PipelineRunner::new(
            context(RetryPolicy::immediate(3)).await,
            stages(Arc::new(MemoryIndex::default())),
            RunnerSettings::default().with_model("nope"),
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::RateLimit(RateLimitError::UnknownModel(_))));
    }

    #[tokio::test]
    async fn long_rate_waits_defer_jobs() {
        let ctx = PipelineContext::in_memory(
            BTreeMap::from([(
                "test-model".to_string(),
                ModelLimit::sliding(2, Duration::from_secs(3600)),
            )]),
            QueueSettings::default().with_poll_interval(Duration::from_millis(5)),
        )
        .await
        .unwrap();
        let runner = PipelineRunner::new(
            ctx,
            stages(Arc::new(MemoryIndex::default())),
            settings().with_max_rate_wait(Some(Duration::from_secs(1))),
        )
        .unwrap();

        let result = runner.process_batch((0..4).map(record), 1).await.unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(result.released, 2);
        let stats = runner.context().queue.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead, 0);
    }

    #[tokio::test]
    async fn shutdown_before_start_processes_nothing() {
        let runner = PipelineRunner::new(
            context(RetryPolicy::immediate(3)).await,
            stages(Arc::new(MemoryIndex::default())),
            settings(),
        )
        .unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = runner
            .process_batch_with((0..3).map(record), BatchOptions::default().with_shutdown(rx))
            .await
            .unwrap();

        assert_eq!(result, BatchResult::default());
        assert_eq!(runner.context().queue.stats().await.unwrap().total(), 0);
    }

    /// Delegates to `inner` after sleeping, to keep jobs in flight.
    struct Slow {
        inner: Arc<dyn Stage>,
        delay: Duration,
    }

    #[async_trait]
    impl Stage for Slow {
        fn kind(&self) -> StageKind {
            self.inner.kind()
        }

        async fn transform(&self, input: StageData) -> Result<StageData, StageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.transform(input).await
        }
    }

    fn slow_embed(delay: Duration) -> Arc<dyn Stage> {
        Arc::new(Slow {
            inner: Arc::new(vaultline_stages::EmbedStage::new(Arc::new(HashingEmbedder::new(32)))),
            delay,
        })
    }

    fn shutdown_after(delay: Duration) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(true);
        });
        rx
    }

    #[tokio::test]
    async fn shutdown_mid_batch_releases_in_flight_jobs() {
        let index = Arc::new(MemoryIndex::default());
        let stages = stages(index.clone()).replace(slow_embed(Duration::from_millis(200)));
        let runner =
            PipelineRunner::new(context(RetryPolicy::immediate(3)).await, stages, settings()).unwrap();

        let options = BatchOptions::default()
            .with_concurrency(2)
            .with_shutdown(shutdown_after(Duration::from_millis(50)));
        let result = runner
            .process_batch_with((0..6).map(record), options)
            .await
            .unwrap();

        assert_eq!(result.released, 2);
        assert_eq!(result.processed, 0);
        assert!(index.is_empty());

        let queue = &runner.context().queue;
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.pending, stats.total(), "every job is back to pending");
        for n in 0..6 {
            if let Some(job) = queue.find_by_hash(&record(n).content_hash()).await.unwrap() {
                assert_eq!(job.attempt_count, 0, "release does not consume an attempt");
                assert!(job.lease_owner.is_none());
            }
        }
    }

    #[tokio::test]
    async fn stage_outliving_the_grace_period_is_reclaimed_later() {
        use crate::jobs::{InMemoryJobStore, JobQueue, JobStore};
        use crate::progress::Ledger;
        use crate::rate_limit::RateLimiter;

        let store = InMemoryJobStore::arc();
        let queue_settings = QueueSettings::default().with_poll_interval(Duration::from_millis(5));
        let progress: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());
        let ctx = PipelineContext::new(
            Arc::new(JobQueue::open(store.clone(), queue_settings.clone()).await.unwrap()),
            Arc::new(Ledger::open(progress.clone()).unwrap()),
            Arc::new(RateLimiter::new(limits()).unwrap()),
            progress,
        );
        let stages = stages(Arc::new(MemoryIndex::default()))
            .replace(slow_embed(Duration::from_secs(30)));
        let runner = PipelineRunner::new(
            ctx,
            stages,
            settings()
                .with_lease(Duration::from_millis(300))
                .with_shutdown_grace(Duration::from_millis(100)),
        )
        .unwrap();

        let options = BatchOptions::default()
            .with_concurrency(2)
            .with_shutdown(shutdown_after(Duration::from_millis(50)));
        let result = runner
            .process_batch_with((0..2).map(record), options)
            .await
            .unwrap();
        assert_eq!(result, BatchResult::default());

        let abandoned = store.list(JobState::InProgress, 10).await.unwrap();
        assert_eq!(abandoned.len(), 2);
        assert!(abandoned.iter().all(|job| job.lease_owner.is_some()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let reopened = JobQueue::open(store.clone(), queue_settings).await.unwrap();
        let stats = reopened.stats().await.unwrap();
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.pending, 2);
    }

    use crate::progress::{InMemoryProgressStore, ProgressRecord, ProgressStore};

    /// Remembers which thread each write ran on.
    #[derive(Default)]
    struct ThreadTrackingStore {
        inner: InMemoryProgressStore,
        writers: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ProgressStore for ThreadTrackingStore {
        fn load(
            &self,
        ) -> Result<std::collections::HashMap<ContentHash, ProgressRecord>, ProgressStoreError> {
            self.inner.load()
        }

        fn upsert(&self, record: ProgressRecord) -> Result<(), ProgressStoreError> {
            self.writers.lock().unwrap().push(std::thread::current().id());
            self.inner.upsert(record)
        }

        fn remove(&self, hash: &ContentHash) -> Result<bool, ProgressStoreError> {
            self.inner.remove(hash)
        }

        fn reset(&self) -> Result<usize, ProgressStoreError> {
            self.inner.reset()
        }
    }

    #[tokio::test]
    async fn ledger_writes_run_off_the_runtime_thread() {
        use crate::jobs::{InMemoryJobStore, JobQueue};
        use crate::progress::Ledger;
        use crate::rate_limit::RateLimiter;

        let store = Arc::new(ThreadTrackingStore::default());
        let ctx = PipelineContext::new(
            Arc::new(
                JobQueue::open(
                    InMemoryJobStore::arc(),
                    QueueSettings::default().with_poll_interval(Duration::from_millis(5)),
                )
                .await
                .unwrap(),
            ),
            Arc::new(Ledger::open(store.clone()).unwrap()),
            Arc::new(RateLimiter::new(limits()).unwrap()),
            store.clone(),
        );
        let runner =
            PipelineRunner::new(ctx, stages(Arc::new(MemoryIndex::default())), settings()).unwrap();

        let mut input: Vec<_> = (0..3).map(record).collect();
        input.push(ConversationRecord::new("conv-empty", "No messages"));
        let result = runner.process_batch(input, 2).await.unwrap();
        assert_eq!((result.processed, result.failed), (3, 1));

        let runtime_thread = std::thread::current().id();
        let writers = store.writers.lock().unwrap();
        assert_eq!(writers.len(), 4);
        assert!(writers.iter().all(|id| *id != runtime_thread));
    }
}
