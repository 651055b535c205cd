use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vaultline_core::{ContentHash, ConversationRecord};

use crate::artifact::Summary;
use crate::embed::{EmbedStage, Embedder};
use crate::error::StageError;
use crate::index::{IndexSink, IndexStage};
use crate::redact::{RedactStage, Redactor};
use crate::summarize::{SummarizeStage, Summarizer};

/// The four stage slots, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Redact,
    Summarize,
    Embed,
    Index,
}

impl StageKind {
    pub const ORDER: [StageKind; 4] = [
        StageKind::Redact,
        StageKind::Summarize,
        StageKind::Embed,
        StageKind::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Redact => "redact",
            StageKind::Summarize => "summarize",
            StageKind::Embed => "embed",
            StageKind::Index => "index",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value threaded through the stages of one job.
///
/// Each stage takes ownership, fills in its part and hands it on. Nothing is
/// committed anywhere until the last stage returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageData {
    pub hash: ContentHash,
    pub record: ConversationRecord,
    /// Upstream model granted by the rate limiter for model-calling stages.
    pub model: Option<String>,
    pub redactions: BTreeMap<String, usize>,
    pub summary: Option<Summary>,
    pub embedding: Option<Vec<f32>>,
    pub indexed: bool,
}

impl StageData {
    pub fn new(hash: ContentHash, record: ConversationRecord) -> Self {
        Self {
            hash,
            record,
            model: None,
            redactions: BTreeMap::new(),
            summary: None,
            embedding: None,
            indexed: false,
        }
    }

    pub fn total_redactions(&self) -> usize {
        self.redactions.values().sum()
    }

    /// The summary produced upstream, or a validation error naming `stage`.
    pub fn require_summary(&self, stage: StageKind) -> Result<&Summary, StageError> {
        self.summary.as_ref().ok_or_else(|| {
            StageError::validation(format!("{stage} stage requires a summary"))
        })
    }
}

/// Uniform interface every stage implements.
///
/// The runner treats all stages the same way; the only thing it asks is
/// whether a stage calls an upstream model, so that it can acquire the rate
/// limiter first.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn kind(&self) -> StageKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// True when `transform` performs a budgeted upstream model call.
    fn calls_model(&self) -> bool {
        false
    }

    async fn transform(&self, input: StageData) -> Result<StageData, StageError>;
}

/// Ordered set of stages run for every job.
#[derive(Clone)]
pub struct StageSet {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// redact → summarize → embed → index.
    pub fn standard(
        redactor: Redactor,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
        sink: Arc<dyn IndexSink>,
    ) -> Self {
        Self::new(vec![
            Arc::new(RedactStage::new(redactor)),
            Arc::new(SummarizeStage::new(summarizer)),
            Arc::new(EmbedStage::new(embedder)),
            Arc::new(IndexStage::new(sink)),
        ])
    }

    /// Swap the stage occupying `stage.kind()`'s slot, keeping the order.
    pub fn replace(mut self, stage: Arc<dyn Stage>) -> Self {
        let kind = stage.kind();
        match self.stages.iter().position(|s| s.kind() == kind) {
            Some(idx) => self.stages[idx] = stage,
            None => {
                let at = self
                    .stages
                    .iter()
                    .position(|s| s.kind() > kind)
                    .unwrap_or(self.stages.len());
                self.stages.insert(at, stage);
            }
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
