//! Progress store: durable map from content hash to processing outcome.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vaultline_core::ContentHash;

/// Terminal outcome of one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub content_hash: ContentHash,
    pub source_id: String,
    pub title: String,
    pub processed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

/// On-disk value; the hash is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    source_id: String,
    title: String,
    processed_at: DateTime<Utc>,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_summary: Option<String>,
}

impl StoredRecord {
    fn from_record(record: &ProgressRecord) -> Self {
        Self {
            source_id: record.source_id.clone(),
            title: record.title.clone(),
            processed_at: record.processed_at,
            success: record.success,
            error_summary: record.error_summary.clone(),
        }
    }

    fn into_record(self, content_hash: ContentHash) -> ProgressRecord {
        ProgressRecord {
            content_hash,
            source_id: self.source_id,
            title: self.title,
            processed_at: self.processed_at,
            success: self.success,
            error_summary: self.error_summary,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressStoreError {
    #[error("progress store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("progress store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable progress persistence.
///
/// Implementations must make each mutating call durable before returning,
/// and never leave a half-written state behind on a crash.
pub trait ProgressStore: Send + Sync {
    /// Everything recorded so far.
    fn load(&self) -> Result<HashMap<ContentHash, ProgressRecord>, ProgressStoreError>;

    /// Insert or replace the record for `record.content_hash`.
    fn upsert(&self, record: ProgressRecord) -> Result<(), ProgressStoreError>;

    /// Drop one hash (force reprocess). Returns whether it existed.
    fn remove(&self, hash: &ContentHash) -> Result<bool, ProgressStoreError>;

    /// Drop everything. Returns the number of records removed.
    fn reset(&self) -> Result<usize, ProgressStoreError>;

    /// Make sure everything accepted so far is on stable storage.
    fn flush(&self) -> Result<(), ProgressStoreError> {
        Ok(())
    }
}

/// Progress store for tests/dev. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    records: Mutex<HashMap<ContentHash, ProgressRecord>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("progress lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn load(&self) -> Result<HashMap<ContentHash, ProgressRecord>, ProgressStoreError> {
        Ok(self.records.lock().expect("progress lock poisoned").clone())
    }

    fn upsert(&self, record: ProgressRecord) -> Result<(), ProgressStoreError> {
        self.records
            .lock()
            .expect("progress lock poisoned")
            .insert(record.content_hash.clone(), record);
        Ok(())
    }

    fn remove(&self, hash: &ContentHash) -> Result<bool, ProgressStoreError> {
        Ok(self
            .records
            .lock()
            .expect("progress lock poisoned")
            .remove(hash)
            .is_some())
    }

    fn reset(&self) -> Result<usize, ProgressStoreError> {
        let mut records = self.records.lock().expect("progress lock poisoned");
        let n = records.len();
        records.clear();
        Ok(n)
    }
}

/// JSON-file progress store.
///
/// The file holds one object keyed by content hash. Every mutation rewrites
/// it through a temp file that is fsynced and then renamed over the
/// original, so readers see either the old or the new state.
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    records: Mutex<BTreeMap<ContentHash, StoredRecord>>,
}

impl FileProgressStore {
    /// Open the store at `path`, creating parent directories.
    ///
    /// An unreadable or corrupt file is moved aside to
    /// `<file>.corrupt-<unix_ms>` and the store starts empty; the next run then
    /// reprocesses everything instead of refusing to start.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProgressStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ProgressStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let records = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<ContentHash, StoredRecord>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    let quarantined = quarantine(&path)?;
                    warn!(
                        path = %path.display(),
                        moved_to = %quarantined.display(),
                        error = %e,
                        "progress store is corrupt; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(ProgressStoreError::Io { path, source }),
        };

        debug!(path = %path.display(), records = records.len(), "opened progress store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> ProgressStoreError {
        ProgressStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn persist(&self, records: &BTreeMap<ContentHash, StoredRecord>) -> Result<(), ProgressStoreError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension(format!("tmp-{}", std::process::id()));

        let mut file = File::create(&tmp).map_err(|e| self.io_err(e))?;
        file.write_all(&bytes).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        sync_parent(&self.path);
        Ok(())
    }

    /// Apply `change` to a copy of the map, persist it, then publish it.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<ContentHash, StoredRecord>) -> T,
    ) -> Result<T, ProgressStoreError> {
        let mut records = self.records.lock().expect("progress lock poisoned");
        let mut next = records.clone();
        let out = change(&mut next);
        self.persist(&next)?;
        *records = next;
        Ok(out)
    }
}

fn quarantine(path: &Path) -> Result<PathBuf, ProgressStoreError> {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", Utc::now().timestamp_millis()));
    let target = PathBuf::from(name);
    fs::rename(path, &target).map_err(|source| ProgressStoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(target)
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

impl ProgressStore for FileProgressStore {
    fn load(&self) -> Result<HashMap<ContentHash, ProgressRecord>, ProgressStoreError> {
        let records = self.records.lock().expect("progress lock poisoned");
        Ok(records
            .iter()
            .map(|(hash, stored)| (hash.clone(), stored.clone().into_record(hash.clone())))
            .collect())
    }

    fn upsert(&self, record: ProgressRecord) -> Result<(), ProgressStoreError> {
        let stored = StoredRecord::from_record(&record);
        self.mutate(|records| {
            records.insert(record.content_hash, stored);
        })
    }

    fn remove(&self, hash: &ContentHash) -> Result<bool, ProgressStoreError> {
        if !self.records.lock().expect("progress lock poisoned").contains_key(hash) {
            return Ok(false);
        }
        self.mutate(|records| records.remove(hash).is_some())
    }

    fn reset(&self) -> Result<usize, ProgressStoreError> {
        self.mutate(|records| {
            let n = records.len();
            records.clear();
            n
        })
    }

    fn flush(&self) -> Result<(), ProgressStoreError> {
        let records = self.records.lock().expect("progress lock poisoned");
        self.persist(&records)
    }
}
