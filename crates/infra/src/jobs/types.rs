//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultline_core::{ContentHash, JobId, WorkerId};

/// Job lifecycle state.
///
/// Transitions: `Pending → InProgress → {Done | Failed → Pending-eligible | Dead}`.
/// `Failed` is a retry-scheduled job waiting for its backoff to elapse; it is
/// claimable exactly like `Pending` once `available_at` has passed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InProgress,
    Done,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::InProgress,
        JobState::Done,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress => "in_progress",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Dead)
    }

    /// Can be handed out by `claim`.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid job state: {s}"))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy shared by the queue's nack path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Policy that retries immediately; handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, 0)
    }

    /// Delay for `attempt`, with jitter spread by `salt` so that jobs failing
    /// together do not all come back at the same instant.
    pub fn jittered_delay(&self, attempt: u32, salt: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            // Deterministic pseudo-random in [-1, 1)
            let pseudo_random = ((attempt as u64 * 17 + salt % 100) % 100) as f64 / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Whether a job that has failed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Failure captured on a job: which stage failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: String,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Short form stored in the progress store.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.stage, self.message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed: {}", self.stage, self.message)
    }
}

/// A unit of ingestion work: one deduplicated conversation record.
///
/// The record itself lives next to the job in the store and is addressed by
/// the job id (see [`Job::payload_ref`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub content_hash: ContentHash,
    /// Upstream record id, for operators.
    pub source_id: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub lease_owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Not claimable before this instant (retry backoff).
    pub available_at: DateTime<Utc>,
    /// Set by a forced enqueue; the runner then ignores existing ledger entries.
    pub forced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<JobError>,
}

impl Job {
    pub fn new(content_hash: ContentHash, source_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            content_hash,
            source_id: source_id.into(),
            state: JobState::Pending,
            attempt_count: 0,
            lease_owner: None,
            lease_expiry: None,
            available_at: now,
            forced: false,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn payload_ref(&self) -> JobId {
        self.id
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.available_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::InProgress && self.lease_expiry.is_none_or(|expiry| expiry <= now)
    }

    /// Salt for retry jitter, derived from the content hash.
    pub fn jitter_salt(&self) -> u64 {
        self.content_hash
            .as_str()
            .bytes()
            .take(8)
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
    }
}

/// State change applied to an in-progress job by its lease holder.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// All stages succeeded.
    Complete,
    /// Failed; claimable again at `available_at`. Consumes an attempt.
    Retry {
        error: JobError,
        available_at: DateTime<Utc>,
    },
    /// Failed for good. Consumes an attempt.
    Kill { error: JobError },
    /// Handed back untouched (shutdown, rate-limit wait). No attempt consumed.
    Release { available_at: DateTime<Utc> },
}

/// Result of an enqueue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new job was created, or a finished one was reset by `force`.
    Created(JobId),
    /// An active job for the same content already exists.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub dead: usize,
}

impl QueueStats {
    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::InProgress => self.in_progress += n,
            JobState::Done => self.done += n,
            JobState::Failed => self.failed += n,
            JobState::Dead => self.dead += n,
        }
    }

    /// Jobs that still need a worker.
    pub fn active(&self) -> usize {
        self.pending + self.in_progress + self.failed
    }

    pub fn total(&self) -> usize {
        self.active() + self.done + self.dead
    }
}

/// A dead-lettered job as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub content_hash: ContentHash,
    pub source_id: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: Option<JobError>,
}

impl From<Job> for DeadLetterEntry {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            content_hash: job.content_hash,
            source_id: job.source_id,
            attempts: job.attempt_count,
            dead_lettered_at: job.updated_at,
            reason: job.last_error,
        }
    }
}
