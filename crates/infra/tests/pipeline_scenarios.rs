//! End-to-end batch behaviour against in-memory components.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use vaultline_core::ConversationRecord;
use vaultline_infra::jobs::{JobState, QueueSettings, RetryPolicy};
use vaultline_infra::progress::{EntryMeta, Outcome};
use vaultline_infra::rate_limit::{ModelLimit, RateLimiter};
use vaultline_infra::{BatchResult, PipelineContext, PipelineRunner, ProgressStore, RunnerSettings};
use vaultline_stages::{
    ExtractiveSummarizer, HashingEmbedder, MemoryIndex, Redactor, Stage, StageData, StageError,
    StageKind, StageSet,
};

const MODEL: &str = "gpt-4o";

fn conversation(n: usize) -> ConversationRecord {
    ConversationRecord::new(format!("conv-{n}"), format!("Weekly sync {n}"))
        .with_message(
            "user",
            format!("Can you reach me at owner{n}@example.com about the Postgres migration?"),
        )
        .with_message(
            "assistant",
            "Sure. We agreed to run the migration on Friday. Next step: schedule the maintenance window.",
        )
}

fn limits() -> BTreeMap<String, ModelLimit> {
    BTreeMap::from([(
        MODEL.to_string(),
        ModelLimit::sliding(150, Duration::from_secs(3 * 3600)),
    )])
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
        Arc::new(HashingEmbedder::new(64)),
        index,
    )
}

fn runner(ctx: PipelineContext, stages: StageSet) -> PipelineRunner {
    PipelineRunner::new(
        ctx,
        stages,
        RunnerSettings::default()
            .with_model(MODEL)
            .with_dequeue_timeout(Duration::from_millis(20)),
    )
    .unwrap()
}

/// Summarize slot that always fails with the given error.
struct BrokenSummarizer {
    error: StageError,
    calls: AtomicUsize,
}

impl BrokenSummarizer {
    fn new(error: StageError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Stage for BrokenSummarizer {
    fn kind(&self) -> StageKind {
        StageKind::Summarize
    }

    fn calls_model(&self) -> bool {
        true
    }

    async fn transform(&self, _input: StageData) -> Result<StageData, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

#[tokio::test]
async fn batch_with_prior_ledger_entries_processes_only_the_delta() {
    let index = Arc::new(MemoryIndex::default());
    let runner = runner(context(RetryPolicy::immediate(3)).await, stages(index.clone()));

    let prior = runner.process_batch((0..3).map(conversation), 2).await.unwrap();
    assert_eq!(prior.processed, 3);

    let result = runner.process_batch((0..10).map(conversation), 4).await.unwrap();

    assert_eq!(
        result,
        BatchResult {
            processed: 7,
            skipped: 3,
            failed: 0,
            released: 0
        }
    );
    assert_eq!(runner.context().progress.load().unwrap().len(), 10);
    assert_eq!(index.total_writes(), 10);
}

#[tokio::test]
async fn recorded_content_is_skipped_without_stage_work() {
    let index = Arc::new(MemoryIndex::default());
    let ctx = context(RetryPolicy::immediate(3)).await;
    let record = conversation(42);
    ctx.ledger
        .record(
            &record.content_hash(),
            &EntryMeta::new(record.id.clone(), record.title.clone()),
            Outcome::Success,
        )
        .unwrap();
    let runner = runner(ctx, stages(index.clone()));

    let result = runner.process_batch(vec![record], 1).await.unwrap();

    assert_eq!(result.skipped, 1);
    assert_eq!(result.processed, 0);
    assert!(index.is_empty());
    assert_eq!(runner.context().queue.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn formatting_only_differences_are_duplicates() {
    let index = Arc::new(MemoryIndex::default());
    let runner = runner(context(RetryPolicy::immediate(3)).await, stages(index.clone()));

    let original = ConversationRecord::new("a", "Release plan")
        .with_message("user", "Ship it on Monday.\nThanks");
    let reformatted = ConversationRecord::new("b", "  Release plan ")
        .with_message("USER", "Ship it on Monday.   \r\nThanks\n");

    let result = runner.process_batch(vec![original, reformatted], 1).await.unwrap();

    assert_eq!(result.processed, 1);
    assert_eq!(result.skipped, 1);
}

#[tokio::test]
async fn validation_failure_dead_letters_after_one_attempt() {
    let broken = BrokenSummarizer::new(StageError::validation("summary missing required fields"));
    let stages = stages(Arc::new(MemoryIndex::default())).replace(broken.clone());
    let runner = runner(context(RetryPolicy::immediate(3)).await, stages);

    let result = runner.process_batch(vec![conversation(1)], 1).await.unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(broken.calls.load(Ordering::SeqCst), 1);

    let job = runner
        .context()
        .queue
        .find_by_hash(&conversation(1).content_hash())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.last_error.unwrap().stage, "summarize");
}

#[tokio::test]
async fn repeated_transient_failures_dead_letter_and_stay_dead() {
    let broken = BrokenSummarizer::new(StageError::transient("upstream timed out"));
    let stages = stages(Arc::new(MemoryIndex::default())).replace(broken.clone());
    let runner = runner(context(RetryPolicy::immediate(3)).await, stages);

    let first = runner.process_batch(vec![conversation(1)], 2).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(broken.calls.load(Ordering::SeqCst), 3);

    let entry = runner
        .context()
        .ledger
        .get(&conversation(1).content_hash())
        .unwrap();
    assert!(!entry.success);
    assert_eq!(
        entry.error_summary.as_deref(),
        Some("summarize: transient failure: upstream timed out")
    );

    let second = runner.process_batch(vec![conversation(1)], 2).await.unwrap();
    assert_eq!(second, BatchResult { skipped: 1, ..Default::default() });
    assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn one_bad_record_does_not_block_the_rest() {
    let index = Arc::new(MemoryIndex::default());
    let runner = runner(context(RetryPolicy::immediate(3)).await, stages(index.clone()));

    let mut input: Vec<_> = (0..4).map(conversation).collect();
    input.insert(2, ConversationRecord::new("empty", "Nothing here"));

    let result = runner.process_batch(input, 2).await.unwrap();

    assert_eq!(result.processed, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(runner.context().ledger.stats().failed, 1);
}

#[tokio::test]
async fn pii_never_reaches_the_index() {
    let index = Arc::new(MemoryIndex::default());
    let runner = runner(context(RetryPolicy::immediate(3)).await, stages(index.clone()));

    runner.process_batch(vec![conversation(7)], 1).await.unwrap();

    let entry = index.get(conversation(7).content_hash().as_str()).unwrap();
    assert_eq!(entry.redactions.get("email"), Some(&1));
    let serialized = serde_json::to_string(&entry).unwrap();
    assert!(!serialized.contains("owner7@example.com"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_are_spread_over_windows() {
    let limiter = Arc::new(
        RateLimiter::new(BTreeMap::from([(
            "m".to_string(),
            ModelLimit::sliding(2, Duration::from_secs(10)),
        )]))
        .unwrap(),
    );
    let (_tx, rx) = watch::channel(false);
    let t0 = Instant::now();

    let mut callers = Vec::new();
    for _ in 0..5 {
        let limiter = limiter.clone();
        let mut rx = rx.clone();
        callers.push(tokio::spawn(async move {
            limiter.acquire("m", None, &mut rx).await.unwrap();
            t0.elapsed()
        }));
    }

    let mut elapsed = Vec::new();
    for caller in callers {
        elapsed.push(caller.await.unwrap());
    }
    elapsed.sort();

    // Each later grant lands just past the end of the window that blocked
    // it; the timer wheel rounds that up by at most a millisecond per wait.
    let expected = [0, 0, 10, 10, 20].map(Duration::from_secs);
    for (got, want) in elapsed.iter().zip(expected) {
        assert!(
            *got >= want && *got < want + Duration::from_millis(5),
            "granted at {got:?}, expected about {want:?}"
        );
    }
    assert!(elapsed[2] > Duration::from_secs(10), "window edge must still count");
}
