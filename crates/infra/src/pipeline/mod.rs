//! Pipeline orchestration: the context bundle and the batch runner.

pub mod context;
pub mod runner;

pub use context::{standard_stages, PipelineContext};
pub use runner::{BatchOptions, BatchResult, PipelineRunner, RunnerError, RunnerSettings};
