//! Final stage: persist the artifact where downstream consumers pick it up.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Summary;
use crate::error::StageError;
use crate::stage::{Stage, StageData, StageKind};

/// Record written by the index stage, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: String,
    pub source_id: String,
    pub title: String,
    pub summary: Summary,
    pub embedding: Vec<f32>,
    pub redactions: BTreeMap<String, usize>,
    pub indexed_at: DateTime<Utc>,
}

#[async_trait]
pub trait IndexSink: Send + Sync + 'static {
    /// Store `entry`, replacing any previous entry for the same hash.
    async fn put(&self, entry: &IndexEntry) -> Result<(), StageError>;
}

/// One JSON file per hash under a directory, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    dir: PathBuf,
}

impl DirectoryIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }
}

#[async_trait]
impl IndexSink for DirectoryIndex {
    async fn put(&self, entry: &IndexEntry) -> Result<(), StageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(entry)?;
        let target = self.path_for(&entry.hash);
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

/// In-process sink; counts writes per hash so tests can detect duplicate
/// output.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: Mutex<HashMap<String, IndexEntry>>,
    writes: Mutex<HashMap<String, usize>>,
}

impl MemoryIndex {
    pub fn len(&self) -> usize {
        self.entries.lock().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, hash: &str) -> Option<IndexEntry> {
        self.entries
            .lock()
            .expect("index lock poisoned")
            .get(hash)
            .cloned()
    }

    pub fn writes(&self, hash: &str) -> usize {
        self.writes
            .lock()
            .expect("index lock poisoned")
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.writes.lock().expect("index lock poisoned").values().sum()
    }
}

#[async_trait]
impl IndexSink for MemoryIndex {
    async fn put(&self, entry: &IndexEntry) -> Result<(), StageError> {
        self.entries
            .lock()
            .expect("index lock poisoned")
            .insert(entry.hash.clone(), entry.clone());
        *self
            .writes
            .lock()
            .expect("index lock poisoned")
            .entry(entry.hash.clone())
            .or_default() += 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct IndexStage {
    sink: Arc<dyn IndexSink>,
}

impl IndexStage {
    pub fn new(sink: Arc<dyn IndexSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Stage for IndexStage {
    fn kind(&self) -> StageKind {
        StageKind::Index
    }

    async fn transform(&self, mut input: StageData) -> Result<StageData, StageError> {
        let summary = input.require_summary(StageKind::Index)?.clone();
        let embedding = input.embedding.clone().ok_or_else(|| {
            StageError::validation("index stage requires an embedding")
        })?;

        let entry = IndexEntry {
            hash: input.hash.to_string(),
            source_id: input.record.id.clone(),
            title: input.record.title.clone(),
            summary,
            embedding,
            redactions: input.redactions.clone(),
            indexed_at: Utc::now(),
        };
        self.sink.put(&entry).await?;
        input.indexed = true;
        Ok(input)
    }
}
