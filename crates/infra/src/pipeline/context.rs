//! Explicit bundle of the shared pipeline components.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use vaultline_stages::{
    DirectoryIndex, ExtractiveSummarizer, HashingEmbedder, Redactor, StageSet,
};

use crate::config::IngestConfig;
use crate::jobs::{InMemoryJobStore, JobQueue, QueueSettings, SqliteJobStore};
use crate::progress::{FileProgressStore, InMemoryProgressStore, Ledger, ProgressStore};
use crate::rate_limit::{ModelLimit, RateLimiter};

use super::runner::RunnerError;

/// Queue, ledger, limiter and progress store a runner works against.
///
/// Cloning shares the components. Tests build isolated instances with
/// [`PipelineContext::in_memory`].
#[derive(Clone)]
pub struct PipelineContext {
    pub queue: Arc<JobQueue>,
    pub ledger: Arc<Ledger>,
    pub limiter: Arc<RateLimiter>,
    pub progress: Arc<dyn ProgressStore>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("queue", &self.queue)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    pub fn new(
        queue: Arc<JobQueue>,
        ledger: Arc<Ledger>,
        limiter: Arc<RateLimiter>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            queue,
            ledger,
            limiter,
            progress,
        }
    }

    /// Open the durable components under `config.data_dir`.
    pub async fn open(config: &IngestConfig) -> Result<Self, RunnerError> {
        config.validate()?;

        let store = SqliteJobStore::open(config.queue_db_path())
            .await
            .map_err(crate::jobs::QueueError::from)?;
        let queue = JobQueue::open(Arc::new(store), config.queue_settings()).await?;

        let progress: Arc<dyn ProgressStore> =
            Arc::new(FileProgressStore::open(config.progress_path())?);
        let ledger = Ledger::open(progress.clone())?;
        let limiter = RateLimiter::new(config.rate_limits.clone())?;

        info!(data_dir = %config.data_dir.display(), "pipeline context opened");
        Ok(Self::new(
            Arc::new(queue),
            Arc::new(ledger),
            Arc::new(limiter),
            progress,
        ))
    }

    /// Fully in-memory context.
    pub async fn in_memory(
        limits: BTreeMap<String, ModelLimit>,
        settings: QueueSettings,
    ) -> Result<Self, RunnerError> {
        let queue = JobQueue::open(InMemoryJobStore::arc(), settings).await?;
        let progress: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());
        let ledger = Ledger::open(progress.clone())?;
        let limiter = RateLimiter::new(limits)?;
        Ok(Self::new(
            Arc::new(queue),
            Arc::new(ledger),
            Arc::new(limiter),
            progress,
        ))
    }
}

/// The built-in stage set configured from `config`: regex redaction, local
/// extractive summaries, hashing embeddings and a JSON index directory.
pub fn standard_stages(config: &IngestConfig) -> Result<StageSet, RunnerError> {
    let redactor = Redactor::from_config(&config.redaction.patterns)
        .map_err(|e| RunnerError::InvalidStages(format!("bad redaction pattern: {e}")))?;
    Ok(StageSet::standard(
        redactor,
        Arc::new(ExtractiveSummarizer::default()),
        Arc::new(HashingEmbedder::new(config.embedding.dimensions)),
        Arc::new(DirectoryIndex::new(config.index_dir())),
    ))
}
