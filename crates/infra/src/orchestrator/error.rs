use coursegen_ai::ProviderError;
use coursegen_core::DomainError;

use super::content::ContentError;
use crate::batch::BatchError;
use crate::jobs::JobStoreError;

/// What the worker does with a failed handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Route through `JobStore::fail` with the retry budget.
    Retry,
    /// Straight to FAILED.
    Terminal,
}

/// Handler-level error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Cancellation observed at a checkpoint. Not a failure.
    #[error("job was cancelled")]
    Cancelled,
}

impl JobError {
    pub fn disposition(&self) -> Disposition {
        match self {
            JobError::TransientProvider(_)
            | JobError::Storage(_)
            | JobError::ConcurrencyConflict(_) => Disposition::Retry,
            JobError::Validation(_)
            | JobError::PermanentProvider(_)
            | JobError::NotFound(_)
            | JobError::Cancelled => Disposition::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => JobError::TransientProvider(msg),
            ProviderError::Permanent(msg) => JobError::PermanentProvider(msg),
            // A bad answer may well be good on the next attempt.
            ProviderError::MalformedOutput(msg) => {
                JobError::TransientProvider(format!("malformed output: {msg}"))
            }
        }
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(format!("job {id}")),
            JobStoreError::Validation(msg) => JobError::Validation(msg),
            JobStoreError::InvalidState { .. }
            | JobStoreError::ConcurrencyConflict(_)
            | JobStoreError::NotReady { .. } => {
                JobError::ConcurrencyConflict(err.to_string())
            }
            JobStoreError::Hierarchy(msg) => JobError::Validation(msg),
            JobStoreError::Storage(msg) => JobError::Storage(msg),
        }
    }
}

impl From<ContentError> for JobError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::NotFound(what) => JobError::NotFound(what),
            ContentError::Storage(msg) => JobError::Storage(msg),
        }
    }
}

impl From<BatchError> for JobError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Validation(msg) => JobError::Validation(msg),
            BatchError::Store(e) => e.into(),
            BatchError::Queue(e) => JobError::Storage(e.to_string()),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => JobError::NotFound("resource".to_string()),
            DomainError::Conflict(msg) => JobError::ConcurrencyConflict(msg),
            other => JobError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobStatus};

    #[test]
    fn provider_errors_are_classified() {
        let transient: JobError = ProviderError::Transient("429".into()).into();
        let permanent: JobError = ProviderError::Permanent("bad key".into()).into();
        let malformed: JobError = ProviderError::MalformedOutput("not json".into()).into();

        assert_eq!(transient.disposition(), Disposition::Retry);
        assert_eq!(permanent.disposition(), Disposition::Terminal);
        assert_eq!(malformed.disposition(), Disposition::Retry);
    }

    #[test]
    fn lost_races_map_to_conflicts() {
        let err: JobError = JobStoreError::InvalidState {
            id: JobId::new(),
            status: JobStatus::Queued,
            operation: "update_progress",
        }
        .into();
        assert!(matches!(err, JobError::ConcurrencyConflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_inputs_are_terminal() {
        let err: JobError = ContentError::NotFound("outline".into()).into();
        assert_eq!(err.disposition(), Disposition::Terminal);
        assert!(!JobError::Validation("x".into()).is_retryable());
    }
}
