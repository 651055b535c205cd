//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vaultline_core::{ContentHash, ConversationRecord, JobId, WorkerId};

use super::types::{Job, JobState, QueueStats, Transition};

/// Durable home of jobs and their payloads.
///
/// Every method is a single atomic step: when it returns `Ok`, the change is
/// committed. Queue semantics (dedup rules, retry decisions, waiting) live in
/// [`super::queue::JobQueue`]; stores only apply state changes.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert `job` with its payload unless a job for the same content hash
    /// already exists, in which case that job is returned untouched.
    async fn insert(
        &self,
        job: Job,
        payload: &ConversationRecord,
    ) -> Result<InsertOutcome, JobStoreError>;

    /// Reset a non-leased job to a fresh forced `Pending` with zero attempts,
    /// replacing its payload.
    async fn reset(
        &self,
        id: JobId,
        payload: &ConversationRecord,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Lease the oldest claimable job whose backoff has elapsed.
    async fn claim(
        &self,
        worker: WorkerId,
        lease_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Apply `transition` to an in-progress job leased by `worker`.
    async fn transition(
        &self,
        id: JobId,
        worker: WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Return in-progress jobs with an expired lease to `Pending`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Job>, JobStoreError>;

    /// Payload of a job. Completed jobs no longer carry one.
    async fn payload(&self, id: JobId) -> Result<Option<ConversationRecord>, JobStoreError>;

    /// Jobs in `state`, oldest update first.
    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move a dead job back to `Pending` with zero attempts.
    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Delete `Done`/`Dead` jobs last updated before `cutoff`.
    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Delete every job and payload.
    async fn clear(&self) -> Result<usize, JobStoreError>;

    async fn stats(&self) -> Result<QueueStats, JobStoreError>;
}

/// Outcome of [`JobStore::insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Job),
    Existing(Job),
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is no longer leased by this worker")]
    LeaseLost(JobId),
    #[error("job {id} is {state}, operation not allowed")]
    InvalidState { id: JobId, state: JobState },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for JobStoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Apply `transition` to `job` in place. Shared by every store so that the
/// state machine has one definition.
pub(crate) fn apply_transition(
    job: &mut Job,
    worker: WorkerId,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<(), JobStoreError> {
    if job.state != JobState::InProgress {
        return Err(JobStoreError::InvalidState {
            id: job.id,
            state: job.state,
        });
    }
    if job.lease_owner != Some(worker) {
        return Err(JobStoreError::LeaseLost(job.id));
    }

    match transition {
        Transition::Complete => {
            job.state = JobState::Done;
            job.last_error = None;
        }
        Transition::Retry {
            error,
            available_at,
        } => {
            job.state = JobState::Failed;
            job.attempt_count += 1;
            job.available_at = available_at;
            job.last_error = Some(error);
        }
        Transition::Kill { error } => {
            job.state = JobState::Dead;
            job.attempt_count += 1;
            job.last_error = Some(error);
        }
        Transition::Release { available_at } => {
            job.state = JobState::Pending;
            job.available_at = available_at;
        }
    }
    job.lease_owner = None;
    job.lease_expiry = None;
    job.updated_at = now;
    Ok(())
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    by_hash: HashMap<ContentHash, JobId>,
    payloads: HashMap<JobId, ConversationRecord>,
}

/// In-memory job store for tests/dev. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("job store lock poisoned")
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(
        &self,
        job: Job,
        payload: &ConversationRecord,
    ) -> Result<InsertOutcome, JobStoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.by_hash.get(&job.content_hash) {
            let existing = inner.jobs[existing].clone();
            return Ok(InsertOutcome::Existing(existing));
        }
        inner.by_hash.insert(job.content_hash.clone(), job.id);
        inner.payloads.insert(job.id, payload.clone());
        inner.jobs.insert(job.id, job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    async fn reset(
        &self,
        id: JobId,
        payload: &ConversationRecord,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.state == JobState::InProgress {
            return Err(JobStoreError::InvalidState {
                id,
                state: job.state,
            });
        }
        job.state = JobState::Pending;
        job.attempt_count = 0;
        job.forced = true;
        job.available_at = now;
        job.updated_at = now;
        job.last_error = None;
        let job = job.clone();
        inner.payloads.insert(id, payload.clone());
        Ok(job)
    }

    async fn claim(
        &self,
        worker: WorkerId,
        lease_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.lock();
        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.state = JobState::InProgress;
        job.lease_owner = Some(worker);
        job.lease_expiry = Some(lease_expiry);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn transition(
        &self,
        id: JobId,
        worker: WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let complete = transition == Transition::Complete;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        apply_transition(job, worker, transition, now)?;
        let job = job.clone();
        if complete {
            inner.payloads.remove(&id);
        }
        Ok(job)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut inner = self.lock();
        let mut reclaimed = 0;
        for job in inner.jobs.values_mut().filter(|j| j.lease_expired(now)) {
            job.state = JobState::Pending;
            job.lease_owner = None;
            job.lease_expiry = None;
            job.available_at = now;
            job.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Job>, JobStoreError> {
        let inner = self.lock();
        Ok(inner
            .by_hash
            .get(hash)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn payload(&self, id: JobId) -> Result<Option<ConversationRecord>, JobStoreError> {
        Ok(self.lock().payloads.get(&id).cloned())
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock();
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.updated_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.state != JobState::Dead {
            return Err(JobStoreError::InvalidState {
                id,
                state: job.state,
            });
        }
        job.state = JobState::Pending;
        job.attempt_count = 0;
        job.available_at = now;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut inner = self.lock();
        let doomed: Vec<(JobId, ContentHash)> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.updated_at < cutoff)
            .map(|j| (j.id, j.content_hash.clone()))
            .collect();
        for (id, hash) in &doomed {
            inner.jobs.remove(id);
            inner.payloads.remove(id);
            inner.by_hash.remove(hash);
        }
        Ok(doomed.len())
    }

    async fn clear(&self) -> Result<usize, JobStoreError> {
        let mut inner = self.lock();
        let n = inner.jobs.len();
        *inner = Inner::default();
        Ok(n)
    }

    async fn stats(&self) -> Result<QueueStats, JobStoreError> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }
}
