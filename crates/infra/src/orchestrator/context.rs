//! Checkpointed execution context handed to job handlers.
//!
//! A handler walks the [`Checkpoint`] sequence forward. Each
//! [`JobContext::advance`] re-reads the job, so a cancel request (or a
//! watchdog reclaim) is observed at the next boundary and never mid-call.

use std::sync::Arc;

use tracing::debug;

use super::error::JobError;
use crate::jobs::{GenerationJob, JobStatus, JobStore};

/// Named workflow boundaries, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Checkpoint {
    Validated,
    ContextGathered,
    Generated,
    OutputParsed,
    Persisted,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::Validated,
        Checkpoint::ContextGathered,
        Checkpoint::Generated,
        Checkpoint::OutputParsed,
        Checkpoint::Persisted,
    ];

    pub fn percent(&self) -> u8 {
        match self {
            Checkpoint::Validated => 10,
            Checkpoint::ContextGathered => 30,
            Checkpoint::Generated => 70,
            Checkpoint::OutputParsed => 85,
            Checkpoint::Persisted => 95,
        }
    }

    pub fn next(&self) -> Option<Checkpoint> {
        match self {
            Checkpoint::Validated => Some(Checkpoint::ContextGathered),
            Checkpoint::ContextGathered => Some(Checkpoint::Generated),
            Checkpoint::Generated => Some(Checkpoint::OutputParsed),
            Checkpoint::OutputParsed => Some(Checkpoint::Persisted),
            Checkpoint::Persisted => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Validated => "validated",
            Checkpoint::ContextGathered => "context_gathered",
            Checkpoint::Generated => "generated",
            Checkpoint::OutputParsed => "output_parsed",
            Checkpoint::Persisted => "persisted",
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct JobContext {
    job: GenerationJob,
    store: Arc<dyn JobStore>,
    reached: Option<Checkpoint>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("reached", &self.reached)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    /// `job` must be the PROCESSING row returned by a claim.
    pub fn new(job: GenerationJob, store: Arc<dyn JobStore>) -> Self {
        Self {
            job,
            store,
            reached: None,
        }
    }

    /// Latest known copy of the job.
    pub fn job(&self) -> &GenerationJob {
        &self.job
    }

    pub fn reached(&self) -> Option<Checkpoint> {
        self.reached
    }

    /// Move to `checkpoint`: order check, cancellation check, progress write.
    ///
    /// Checkpoints may be skipped but never repeated or revisited.
    pub async fn advance(&mut self, checkpoint: Checkpoint, message: &str) -> Result<(), JobError> {
        if let Some(reached) = self.reached {
            if checkpoint <= reached {
                return Err(JobError::Validation(format!(
                    "checkpoint {checkpoint} is out of order after {reached}"
                )));
            }
        }

        let current = self
            .store
            .get(self.job.tenant_id, self.job.id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("job {}", self.job.id)))?;

        match current.status {
            JobStatus::Processing => {}
            JobStatus::Cancelled => {
                debug!(job_id = %current.id, %checkpoint, "cancellation observed at checkpoint");
                self.job = current;
                return Err(JobError::Cancelled);
            }
            other => {
                return Err(JobError::ConcurrencyConflict(format!(
                    "job {} is {other}, no longer owned by this worker",
                    current.id
                )));
            }
        }

        let transition = self
            .store
            .update_progress(self.job.id, checkpoint.percent(), message)
            .await?;
        if !transition.applied && transition.job.status == JobStatus::Cancelled {
            self.job = transition.job;
            return Err(JobError::Cancelled);
        }

        debug!(job_id = %self.job.id, %checkpoint, percent = checkpoint.percent(), "checkpoint reached");
        self.job = transition.job;
        self.reached = Some(checkpoint);
        Ok(())
    }
}
