//! Generation jobs: data model, state machine and persistence.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and typed (one payload variant per job type)
//! - The store owns the retry-vs-terminal decision (`fail`)
//! - Exclusive ownership comes from a conditional claim, never an in-process lock
//! - Parent/child is a foreign key (`parent_job_id`), traversed by query
//!
//! ## Components
//!
//! - `GenerationJob`: the job row and its transitions
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `RetryPolicy`: backoff schedule for requeued jobs

pub mod error;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use error::JobStoreError;
pub use postgres::PostgresJobStore;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{InMemoryJobStore, JobStore};
pub use types::{
    CorrelationRefs, DEFAULT_MAX_RETRIES, GenerationJob, JobFilter, JobId, JobPayload, JobStats,
    JobStatus, JobType, NewJob, ParentResolution, Transition,
};
