//! Persistent job queue with leases, retry backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `Job`: one deduplicated conversation record moving through the pipeline
//! - `JobStore`: persistence for jobs and their payloads (in-memory or SQLite)
//! - `JobQueue`: enqueue/dequeue/ack/nack semantics on top of a store
//! - `RetryPolicy`: backoff shared by the nack path

pub mod queue;
pub mod sqlite;
pub mod store;
pub mod types;

pub use queue::{JobQueue, QueueError, QueueSettings};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, InsertOutcome, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, EnqueueOutcome, Job, JobError, JobState, QueueStats,
    RetryPolicy, Transition,
};
