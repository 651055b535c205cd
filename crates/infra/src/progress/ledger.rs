//! Deduplication ledger: "has this content already been processed?"
//!
//! Answers from an in-memory index loaded once from the [`ProgressStore`];
//! writes go to the store first and reach the index only once durable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use vaultline_core::ContentHash;

use super::store::{ProgressRecord, ProgressStore, ProgressStoreError};

/// Terminal outcome recorded for a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Dead-lettered, with `stage: message`.
    Failure(String),
}

impl Outcome {
    fn matches(&self, record: &ProgressRecord) -> bool {
        match self {
            Outcome::Success => record.success,
            Outcome::Failure(summary) => {
                !record.success && record.error_summary.as_deref() == Some(summary.as_str())
            }
        }
    }
}

/// Descriptive fields stored next to an outcome.
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub source_id: String,
    pub title: String,
}

impl EntryMeta {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Ledger {
    store: Arc<dyn ProgressStore>,
    index: RwLock<HashMap<ContentHash, ProgressRecord>>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Build the index from everything the store holds.
    pub fn open(store: Arc<dyn ProgressStore>) -> Result<Self, ProgressStoreError> {
        let index = store.load()?;
        info!(entries = index.len(), "ledger loaded");
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    /// Whether `hash` has a terminal outcome, successful or not.
    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.index
            .read()
            .expect("ledger lock poisoned")
            .contains_key(hash)
    }

    /// Whether `hash` was processed successfully.
    pub fn is_done(&self, hash: &ContentHash) -> bool {
        self.index
            .read()
            .expect("ledger lock poisoned")
            .get(hash)
            .is_some_and(|r| r.success)
    }

    pub fn get(&self, hash: &ContentHash) -> Option<ProgressRecord> {
        self.index
            .read()
            .expect("ledger lock poisoned")
            .get(hash)
            .cloned()
    }

    /// Record a terminal outcome.
    ///
    /// Recording the outcome a hash already has is a no-op and returns
    /// `false`; a different outcome replaces the old one.
    pub fn record(
        &self,
        hash: &ContentHash,
        meta: &EntryMeta,
        outcome: Outcome,
    ) -> Result<bool, ProgressStoreError> {
        if self
            .index
            .read()
            .expect("ledger lock poisoned")
            .get(hash)
            .is_some_and(|existing| outcome.matches(existing))
        {
            return Ok(false);
        }

        let (success, error_summary) = match outcome {
            Outcome::Success => (true, None),
            Outcome::Failure(summary) => (false, Some(summary)),
        };
        let record = ProgressRecord {
            content_hash: hash.clone(),
            source_id: meta.source_id.clone(),
            title: meta.title.clone(),
            processed_at: Utc::now(),
            success,
            error_summary,
        };

        self.store.upsert(record.clone())?;
        self.index
            .write()
            .expect("ledger lock poisoned")
            .insert(hash.clone(), record);
        debug!(hash = %hash.short(), success, "ledger entry recorded");
        Ok(true)
    }

    /// Forget `hash` so the next batch processes it again.
    pub fn forget(&self, hash: &ContentHash) -> Result<bool, ProgressStoreError> {
        let removed = self.store.remove(hash)?;
        self.index
            .write()
            .expect("ledger lock poisoned")
            .remove(hash);
        if removed {
            info!(hash = %hash.short(), "ledger entry removed for reprocessing");
        }
        Ok(removed)
    }

    /// Forget everything.
    pub fn reset(&self) -> Result<usize, ProgressStoreError> {
        let removed = self.store.reset()?;
        self.index.write().expect("ledger lock poisoned").clear();
        info!(removed, "ledger reset");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.index.read().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LedgerStats {
        let index = self.index.read().expect("ledger lock poisoned");
        let succeeded = index.values().filter(|r| r.success).count();
        LedgerStats {
            total: index.len(),
            succeeded,
            failed: index.len() - succeeded,
        }
    }

    /// Failed entries, most recent first.
    pub fn failures(&self) -> Vec<ProgressRecord> {
        let index = self.index.read().expect("ledger lock poisoned");
        let mut failed: Vec<_> = index.values().filter(|r| !r.success).cloned().collect();
        failed.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        failed
    }

    pub fn flush(&self) -> Result<(), ProgressStoreError> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::store::{FileProgressStore, InMemoryProgressStore};
    use vaultline_core::ConversationRecord;

    fn hash(n: usize) -> ContentHash {
        ConversationRecord::new(format!("c-{n}"), "t")
            .with_message("user", format!("body {n}"))
            .content_hash()
    }

    fn ledger() -> (Arc<InMemoryProgressStore>, Ledger) {
        let store = Arc::new(InMemoryProgressStore::new());
        let ledger = Ledger::open(store.clone()).unwrap();
        (store, ledger)
    }

    #[test]
    fn record_is_idempotent_for_same_outcome() {
        let (_, ledger) = ledger();
        let meta = EntryMeta::new("c-1", "t");

        assert!(ledger.record(&hash(1), &meta, Outcome::Success).unwrap());
        let first = ledger.get(&hash(1)).unwrap();
        assert!(!ledger.record(&hash(1), &meta, Outcome::Success).unwrap());

        assert_eq!(ledger.get(&hash(1)).unwrap().processed_at, first.processed_at);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn different_outcome_overwrites() {
        let (store, ledger) = ledger();
        let meta = EntryMeta::new("c-1", "t");

        ledger
            .record(&hash(1), &meta, Outcome::Failure("embed: timeout".into()))
            .unwrap();
        assert!(ledger.exists(&hash(1)));
        assert!(!ledger.is_done(&hash(1)));

        assert!(ledger.record(&hash(1), &meta, Outcome::Success).unwrap());
        assert!(ledger.is_done(&hash(1)));
        assert!(store.load().unwrap()[&hash(1)].success);
    }

    #[test]
    fn index_is_rebuilt_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        {
            let store = Arc::new(FileProgressStore::open(&path).unwrap());
            let ledger = Ledger::open(store).unwrap();
            ledger
                .record(&hash(1), &EntryMeta::new("c-1", "t"), Outcome::Success)
                .unwrap();
            ledger
                .record(
                    &hash(2),
                    &EntryMeta::new("c-2", "t"),
                    Outcome::Failure("summarize: bad schema".into()),
                )
                .unwrap();
        }

        let ledger = Ledger::open(Arc::new(FileProgressStore::open(&path).unwrap())).unwrap();
        assert!(ledger.is_done(&hash(1)));
        assert!(ledger.exists(&hash(2)));
        assert!(!ledger.exists(&hash(3)));
        assert_eq!(
            ledger.stats(),
            LedgerStats {
                total: 2,
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(ledger.failures()[0].source_id, "c-2");
    }

    #[test]
    fn forget_and_reset() {
        let (store, ledger) = ledger();
        for n in 0..3 {
            ledger
                .record(&hash(n), &EntryMeta::new(format!("c-{n}"), "t"), Outcome::Success)
                .unwrap();
        }

        assert!(ledger.forget(&hash(0)).unwrap());
        assert!(!ledger.exists(&hash(0)));
        assert_eq!(store.len(), 2);

        assert_eq!(ledger.reset().unwrap(), 2);
        assert!(ledger.is_empty());
        assert!(store.is_empty());
    }
}
