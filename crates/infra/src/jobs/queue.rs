//! Queue facade over a [`JobStore`]: dedup-aware enqueue, blocking dequeue
//! with leases, and the retry/dead-letter decision on nack.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vaultline_core::{ContentHash, ConversationRecord, JobId, WorkerId};

use super::store::{InsertOutcome, JobStore, JobStoreError};
use super::types::{
    DeadLetterEntry, EnqueueOutcome, Job, JobError, JobState, QueueStats, RetryPolicy, Transition,
};

/// Queue-level error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("content {0} was already processed")]
    AlreadyDone(ContentHash),
    #[error("content {0} is dead-lettered")]
    AlreadyDead(ContentHash),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Tunables for [`JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub retry: RetryPolicy,
    /// How often a blocked dequeue re-checks for jobs whose backoff elapsed.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl QueueSettings {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Durable work pool with lease-based at-least-once delivery.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    available: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl JobQueue {
    /// Open the queue and return abandoned in-progress jobs to `Pending`.
    pub async fn open(store: Arc<dyn JobStore>, settings: QueueSettings) -> Result<Self, QueueError> {
        let queue = Self {
            store,
            settings,
            available: Notify::new(),
        };
        queue.recover_expired().await?;
        Ok(queue)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Add work for `record`.
    ///
    /// A hash that already has a job never gets a second one. Without `force`
    /// a finished job is an error and an active one is reported as a
    /// duplicate; with `force` a finished or waiting job is reset to a fresh
    /// `Pending`. A job currently leased is left alone either way.
    pub async fn enqueue(
        &self,
        hash: &ContentHash,
        record: &ConversationRecord,
        force: bool,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = Utc::now();
        let job = Job::new(hash.clone(), record.id.clone(), now).forced(force);

        let existing = match self.store.insert(job, record).await? {
            InsertOutcome::Inserted(job) => {
                debug!(job_id = %job.id, hash = %hash.short(), "enqueued");
                self.available.notify_waiters();
                return Ok(EnqueueOutcome::Created(job.id));
            }
            InsertOutcome::Existing(existing) => existing,
        };

        match (existing.state, force) {
            (JobState::Done, false) => Err(QueueError::AlreadyDone(hash.clone())),
            (JobState::Dead, false) => Err(QueueError::AlreadyDead(hash.clone())),
            (JobState::InProgress, _) | (JobState::Pending | JobState::Failed, false) => {
                Ok(EnqueueOutcome::Duplicate(existing.id))
            }
            (previous, true) => {
                let job = self.store.reset(existing.id, record, now).await?;
                info!(job_id = %job.id, hash = %hash.short(), %previous, "forced re-enqueue");
                self.available.notify_waiters();
                Ok(EnqueueOutcome::Created(job.id))
            }
        }
    }

    /// Lease the next ready job to `worker`, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when nothing became available in time. A timed-out
    /// wait also reclaims expired leases, so jobs abandoned by a crashed
    /// worker come back without a restart.
    pub async fn dequeue(
        &self,
        worker: WorkerId,
        lease: Duration,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.claim(worker, lease).await? {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let nap = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }

        if self.recover_expired().await? > 0 {
            return self.claim(worker, lease).await;
        }
        Ok(None)
    }

    async fn claim(&self, worker: WorkerId, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let job = self.store.claim(worker, after(now, lease), now).await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, %worker, attempt = job.attempt_count + 1, "leased");
        }
        Ok(job)
    }

    /// Mark a leased job `Done`.
    pub async fn ack(&self, id: JobId, worker: WorkerId) -> Result<Job, QueueError> {
        let job = self
            .store
            .transition(id, worker, Transition::Complete, Utc::now())
            .await?;
        debug!(job_id = %id, "acked");
        Ok(job)
    }

    /// Report a failed attempt.
    ///
    /// Retryable errors go back to the pool after a jittered backoff while
    /// attempts remain; anything else (or the last attempt) dead-letters the
    /// job. Returns the updated job so callers can tell which happened.
    pub async fn nack(&self, id: JobId, worker: WorkerId, error: JobError) -> Result<Job, QueueError> {
        let now = Utc::now();
        let current = self.store.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
        let attempts = current.attempt_count + 1;

        let transition = if error.retryable && self.settings.retry.should_retry(attempts) {
            let delay = self
                .settings
                .retry
                .jittered_delay(attempts, current.jitter_salt());
            Transition::Retry {
                error,
                available_at: after(now, delay),
            }
        } else {
            Transition::Kill { error }
        };

        let job = self.store.transition(id, worker, transition, now).await?;
        match job.state {
            JobState::Dead => warn!(job_id = %id, attempts = job.attempt_count, "dead-lettered"),
            _ => {
                debug!(job_id = %id, attempts = job.attempt_count, retry_at = %job.available_at, "scheduled retry");
                self.available.notify_waiters();
            }
        }
        Ok(job)
    }

    /// Hand a leased job back without consuming an attempt.
    pub async fn release(&self, id: JobId, worker: WorkerId, delay: Duration) -> Result<Job, QueueError> {
        let now = Utc::now();
        let job = self
            .store
            .transition(
                id,
                worker,
                Transition::Release {
                    available_at: after(now, delay),
                },
                now,
            )
            .await?;
        debug!(job_id = %id, ?delay, "released");
        self.available.notify_waiters();
        Ok(job)
    }

    /// Return every in-progress job whose lease has expired to `Pending`.
    pub async fn recover_expired(&self) -> Result<usize, QueueError> {
        let reclaimed = self.store.reclaim_expired(Utc::now()).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed jobs with expired leases");
            self.available.notify_waiters();
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Job>, QueueError> {
        Ok(self.store.find_by_hash(hash).await?)
    }

    /// Record a leased job will process.
    pub async fn payload(&self, id: JobId) -> Result<Option<ConversationRecord>, QueueError> {
        Ok(self.store.payload(id).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let jobs = self.store.list(JobState::Dead, limit).await?;
        Ok(jobs.into_iter().map(DeadLetterEntry::from).collect())
    }

    /// Put a dead-lettered job back in the pool with a fresh attempt budget.
    pub async fn requeue_dead(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self.store.requeue(id, Utc::now()).await?;
        info!(job_id = %id, hash = %job.content_hash.short(), "requeued dead letter");
        self.available.notify_waiters();
        Ok(job)
    }

    /// Delete finished jobs last touched more than `older_than` ago.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let cutoff = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge(cutoff).await?;
        info!(purged, %cutoff, "purged finished jobs");
        Ok(purged)
    }

    /// Drop every job. Operator reset.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let cleared = self.store.clear().await?;
        warn!(cleared, "queue cleared");
        Ok(cleared)
    }
}
