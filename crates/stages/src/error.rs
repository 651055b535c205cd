use thiserror::Error;

use vaultline_core::DomainError;

/// Failure of a single stage transform.
///
/// The variant decides what the queue does with the job: transient and
/// rate-limited failures are retried with backoff, validation failures are
/// dead-lettered on the first attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Network/timeout style failure of an external call.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Structural defect in the input or in a stage's output.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The upstream model throttled the call despite a local grant.
    #[error("upstream rate limited: {0}")]
    RateLimited(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether retrying the same input could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

impl From<DomainError> for StageError {
    fn from(value: DomainError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Validation(format!("malformed artifact: {value}"))
    }
}

impl From<std::io::Error> for StageError {
    fn from(value: std::io::Error) -> Self {
        Self::Transient(format!("io: {value}"))
    }
}
