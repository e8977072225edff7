use chrono::{DateTime, Utc};
use coursegen_core::DomainError;

use super::types::{JobId, JobStatus};

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {id} is {status}; cannot {operation}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    /// Lost a conditional update (e.g. another worker claimed the job first).
    #[error("concurrency conflict on job {0}")]
    ConcurrencyConflict(JobId),

    /// QUEUED but waiting out a retry backoff.
    #[error("job {id} is not claimable before {until}")]
    NotReady { id: JobId, until: DateTime<Utc> },

    /// Parent/child rules: children never have children, a parent fans out once.
    #[error("hierarchy violation: {0}")]
    Hierarchy(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvariantViolation(msg) => Self::Hierarchy(msg),
            DomainError::Conflict(msg) => Self::Storage(format!("conflict: {msg}")),
            DomainError::NotFound => Self::Storage("not found".to_string()),
        }
    }
}

pub(crate) fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}
