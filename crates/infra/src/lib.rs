//! `vaultline-infra`
//!
//! **Responsibility:** everything stateful in the ingestion pipeline.
//!
//! - `progress`: durable progress store and the dedup ledger over it
//! - `jobs`: persistent job queue (in-memory and SQLite stores)
//! - `rate_limit`: per-model sliding-window rate limiter with fallbacks
//! - `pipeline`: context bundle and the batch runner
//! - `config`: TOML/env configuration

pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;

pub use config::{ConfigError, IngestConfig};
pub use jobs::{EnqueueOutcome, JobQueue, JobState, QueueError, QueueSettings, RetryPolicy};
pub use pipeline::{
    standard_stages, BatchOptions, BatchResult, PipelineContext, PipelineRunner, RunnerError,
    RunnerSettings,
};
pub use progress::{Ledger, ProgressRecord, ProgressStore};
pub use rate_limit::{Acquisition, ModelLimit, RateLimiter, WindowSpec};
