//! Generation job model and its state machine.
//!
//! ```text
//! QUEUED ──claim──▶ PROCESSING ──complete──▶ COMPLETED
//!   ▲                  │  │
//!   └──fail (retry)────┘  ├──fail (exhausted)──▶ FAILED
//!                         └──cancel────────────▶ CANCELLED   (also from QUEUED)
//! ```
//!
//! COMPLETED / FAILED / CANCELLED are terminal: further transition attempts
//! are no-ops, never errors.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coursegen_core::{
    CourseId, DomainError, LessonId, SmeTaskId, SubmissionId, TenantId, UserId,
};

use super::error::JobStoreError;
use super::retry::RetryPolicy;

/// Default retry budget for a new job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Job type, used for routing to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    SmeIngestion,
    CourseOutline,
    LessonContent,
    ComponentRegen,
    FullCourse,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::SmeIngestion,
        JobType::CourseOutline,
        JobType::LessonContent,
        JobType::ComponentRegen,
        JobType::FullCourse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SmeIngestion => "SME_INGESTION",
            JobType::CourseOutline => "COURSE_OUTLINE",
            JobType::LessonContent => "LESSON_CONTENT",
            JobType::ComponentRegen => "COMPONENT_REGEN",
            JobType::FullCourse => "FULL_COURSE",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly scheduled for a later retry)
    Queued,
    /// Owned by exactly one worker
    Processing,
    Completed,
    /// Retries exhausted or permanent error
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Type-specific job input. One variant per [`JobType`], validated when the
/// job is created rather than when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    SmeIngestion {
        sme_task_id: SmeTaskId,
        submission_id: SubmissionId,
    },
    CourseOutline {
        course_id: CourseId,
        brief: String,
    },
    LessonContent {
        course_id: CourseId,
        lesson_id: LessonId,
    },
    ComponentRegen {
        course_id: CourseId,
        lesson_id: LessonId,
        component: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
    FullCourse {
        course_id: CourseId,
    },
}

/// Correlation columns derived from a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationRefs {
    pub course_id: Option<CourseId>,
    pub lesson_id: Option<LessonId>,
    pub sme_task_id: Option<SmeTaskId>,
    pub submission_id: Option<SubmissionId>,
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::SmeIngestion { .. } => JobType::SmeIngestion,
            JobPayload::CourseOutline { .. } => JobType::CourseOutline,
            JobPayload::LessonContent { .. } => JobType::LessonContent,
            JobPayload::ComponentRegen { .. } => JobType::ComponentRegen,
            JobPayload::FullCourse { .. } => JobType::FullCourse,
        }
    }

    /// Reject payloads with missing correlation refs or empty required text.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            JobPayload::SmeIngestion {
                sme_task_id,
                submission_id,
            } => {
                require(!sme_task_id.is_nil(), "sme_task_id is required")?;
                require(!submission_id.is_nil(), "submission_id is required")
            }
            JobPayload::CourseOutline { course_id, brief } => {
                require(!course_id.is_nil(), "course_id is required")?;
                require(!brief.trim().is_empty(), "brief must not be empty")
            }
            JobPayload::LessonContent {
                course_id,
                lesson_id,
            } => {
                require(!course_id.is_nil(), "course_id is required")?;
                require(!lesson_id.is_nil(), "lesson_id is required")
            }
            JobPayload::ComponentRegen {
                course_id,
                lesson_id,
                component,
                ..
            } => {
                require(!course_id.is_nil(), "course_id is required")?;
                require(!lesson_id.is_nil(), "lesson_id is required")?;
                require(!component.trim().is_empty(), "component must not be empty")
            }
            JobPayload::FullCourse { course_id } => {
                require(!course_id.is_nil(), "course_id is required")
            }
        }
    }

    pub fn refs(&self) -> CorrelationRefs {
        match self {
            JobPayload::SmeIngestion {
                sme_task_id,
                submission_id,
            } => CorrelationRefs {
                sme_task_id: Some(*sme_task_id),
                submission_id: Some(*submission_id),
                ..Default::default()
            },
            JobPayload::CourseOutline { course_id, .. } | JobPayload::FullCourse { course_id } => {
                CorrelationRefs {
                    course_id: Some(*course_id),
                    ..Default::default()
                }
            }
            JobPayload::LessonContent {
                course_id,
                lesson_id,
            }
            | JobPayload::ComponentRegen {
                course_id,
                lesson_id,
                ..
            } => CorrelationRefs {
                course_id: Some(*course_id),
                lesson_id: Some(*lesson_id),
                ..Default::default()
            },
        }
    }
}

fn require(cond: bool, msg: &str) -> Result<(), DomainError> {
    if cond {
        Ok(())
    } else {
        Err(DomainError::validation(msg))
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub created_by_user_id: UserId,
    pub payload: JobPayload,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(tenant_id: TenantId, created_by_user_id: UserId, payload: JobPayload) -> Self {
        Self {
            tenant_id,
            created_by_user_id,
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// The unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub progress_percent: u8,
    pub progress_message: String,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub tokens_used: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_job_id: Option<JobId>,
    pub course_id: Option<CourseId>,
    pub lesson_id: Option<LessonId>,
    pub sme_task_id: Option<SmeTaskId>,
    pub submission_id: Option<SubmissionId>,
    pub created_by_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a requeued job may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Result of a transition attempt. `applied == false` means the job was
/// already terminal and nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub job: GenerationJob,
    pub applied: bool,
}

impl Transition {
    pub fn applied(job: GenerationJob) -> Self {
        Self { job, applied: true }
    }

    pub fn noop(job: GenerationJob) -> Self {
        Self {
            job,
            applied: false,
        }
    }
}

/// Terminal outcome chosen for a batch parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentResolution {
    pub status: JobStatus,
    pub message: String,
    pub tokens_used: u64,
}

impl GenerationJob {
    /// Build a QUEUED job from a validated request.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Result<Self, JobStoreError> {
        new.payload.validate()?;
        let refs = new.payload.refs();

        Ok(Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            job_type: new.payload.job_type(),
            status: JobStatus::Queued,
            payload: new.payload,
            progress_percent: 0,
            progress_message: String::new(),
            result_path: None,
            error_message: None,
            tokens_used: 0,
            retry_count: 0,
            max_retries: new.max_retries,
            parent_job_id: None,
            course_id: refs.course_id,
            lesson_id: refs.lesson_id,
            sme_task_id: refs.sme_task_id,
            submission_id: refs.submission_id,
            created_by_user_id: new.created_by_user_id,
            created_at: now,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
        })
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Time left before a scheduled retry may be claimed.
    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.next_attempt_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default()
    }

    /// Claimable: queued and not scheduled for a future retry.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.is_ready(now)
    }

    /// QUEUED → PROCESSING once any retry backoff has elapsed. A job that
    /// is no longer QUEUED is a lost race.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        if self.status != JobStatus::Queued {
            return Err(JobStoreError::ConcurrencyConflict(self.id));
        }
        if let Some(until) = self.next_attempt_at.filter(|at| *at > now) {
            return Err(JobStoreError::NotReady { id: self.id, until });
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.next_attempt_at = None;
        Ok(())
    }

    /// Progress never moves backwards and is clamped to 100.
    pub fn record_progress(&mut self, percent: u8, message: &str) -> Result<bool, JobStoreError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.require_processing("update_progress")?;
        self.progress_percent = self.progress_percent.max(percent.min(100));
        self.progress_message = message.to_string();
        Ok(true)
    }

    pub fn complete(
        &mut self,
        result_path: Option<String>,
        tokens_used: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.require_processing("complete")?;
        self.status = JobStatus::Completed;
        self.progress_percent = 100;
        self.result_path = result_path;
        self.tokens_used = self.tokens_used.saturating_add(tokens_used);
        self.completed_at = Some(now);
        Ok(true)
    }

    /// Record a failure. `retryable == false` skips the retry budget.
    ///
    /// With budget left the job goes back to QUEUED with `retry_count + 1`
    /// and a backoff schedule; otherwise it becomes FAILED.
    pub fn fail(
        &mut self,
        error: &str,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.require_processing("fail")?;
        self.error_message = Some(error.to_string());

        if retryable && self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.requeue(Some(now + to_chrono(policy.delay_for_attempt(self.retry_count))));
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        }
        Ok(true)
    }

    /// Watchdog path for a job whose worker vanished.
    pub fn reclaim(&mut self, stale_after: std::time::Duration, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.requeue(None);
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.error_message = Some(format!(
                "worker did not finish within {}s",
                stale_after.as_secs()
            ));
        }
        true
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.next_attempt_at = None;
        true
    }

    /// Conditional PROCESSING → terminal for a batch parent.
    pub fn resolve(&mut self, resolution: &ParentResolution, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing || !resolution.status.is_terminal() {
            return false;
        }
        self.status = resolution.status;
        self.tokens_used = resolution.tokens_used;
        self.progress_message = resolution.message.clone();
        if resolution.status == JobStatus::Completed {
            self.progress_percent = 100;
        } else {
            self.error_message = Some(resolution.message.clone());
        }
        self.completed_at = Some(now);
        true
    }

    pub fn is_stale(&self, stale_after: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self
                .started_at
                .is_some_and(|started| now - started > to_chrono(stale_after))
    }

    fn requeue(&mut self, next_attempt_at: Option<DateTime<Utc>>) {
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.progress_percent = 0;
        self.progress_message = String::new();
        self.next_attempt_at = next_attempt_at;
    }

    fn require_processing(&self, op: &'static str) -> Result<(), JobStoreError> {
        if self.status == JobStatus::Processing {
            Ok(())
        } else {
            Err(JobStoreError::InvalidState {
                id: self.id,
                status: self.status,
                operation: op,
            })
        }
    }
}

pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub course_id: Option<CourseId>,
    pub parent_job_id: Option<JobId>,
}

impl JobFilter {
    pub fn matches(&self, job: &GenerationJob) -> bool {
        self.job_type.is_none_or(|t| job.job_type == t)
            && self.status.is_none_or(|s| job.status == s)
            && self.course_id.is_none_or(|c| job.course_id == Some(c))
            && self.parent_job_id.is_none_or(|p| job.parent_job_id == Some(p))
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outline_job() -> GenerationJob {
        let new = NewJob::new(
            TenantId::new(),
            UserId::new(),
            JobPayload::CourseOutline {
                course_id: CourseId::new(),
                brief: "Intro to ownership".into(),
            },
        );
        GenerationJob::from_new(new, Utc::now()).unwrap()
    }

    #[test]
    fn new_job_starts_queued_with_zero_progress() {
        let job = outline_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress_percent, 0);
        assert_eq!(job.job_type, JobType::CourseOutline);
        assert!(job.course_id.is_some());
        assert!(job.lesson_id.is_none());
    }

    #[test]
    fn missing_refs_are_rejected() {
        let payload = JobPayload::LessonContent {
            course_id: CourseId::new(),
            lesson_id: LessonId::from_uuid(Uuid::nil()),
        };
        let new = NewJob::new(TenantId::new(), UserId::new(), payload);
        assert!(matches!(
            GenerationJob::from_new(new, Utc::now()),
            Err(JobStoreError::Validation(_))
        ));
    }

    #[test]
    fn empty_brief_is_rejected() {
        let payload = JobPayload::CourseOutline {
            course_id: CourseId::new(),
            brief: "   ".into(),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn progress_is_monotonic_and_requires_processing() {
        let mut job = outline_job();
        assert!(matches!(
            job.record_progress(10, "x"),
            Err(JobStoreError::InvalidState { .. })
        ));

        job.claim(Utc::now()).unwrap();
        job.record_progress(40, "half").unwrap();
        job.record_progress(20, "stale update").unwrap();
        assert_eq!(job.progress_percent, 40);
        job.record_progress(250, "overflow").unwrap();
        assert_eq!(job.progress_percent, 100);
    }

    #[test]
    fn fail_requeues_until_budget_exhausted() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10));
        let mut job = outline_job();
        let now = Utc::now();

        let mut at = now;
        for expected in 1..=3 {
            job.claim(at).unwrap();
            assert!(job.fail("timeout", true, &policy, at).unwrap());
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(job.retry_count, expected);
            at = job.next_attempt_at.expect("backoff scheduled");
        }

        job.claim(at).unwrap();
        job.fail("timeout", true, &policy, at).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);

        // Further failures are no-ops.
        assert!(!job.fail("again", true, &policy, now).unwrap());
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn permanent_failure_skips_budget() {
        let mut job = outline_job();
        job.claim(Utc::now()).unwrap();
        job.fail("bad key", false, &RetryPolicy::default(), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn cancel_never_reopens_terminal_jobs() {
        let mut job = outline_job();
        job.claim(Utc::now()).unwrap();
        job.complete(Some("courses/x".into()), 10, Utc::now()).unwrap();

        assert!(!job.cancel(Utc::now()));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn claim_twice_is_a_conflict() {
        let mut job = outline_job();
        job.claim(Utc::now()).unwrap();
        assert!(matches!(
            job.claim(Utc::now()),
            Err(JobStoreError::ConcurrencyConflict(_))
        ));
    }

    #[test]
    fn claim_waits_out_the_retry_backoff() {
        let policy = RetryPolicy::fixed(Duration::from_secs(60));
        let mut job = outline_job();
        let now = Utc::now();
        job.claim(now).unwrap();
        job.fail("timeout", true, &policy, now).unwrap();

        let until = job.next_attempt_at.unwrap();
        assert!(!job.is_claimable(now));
        assert_eq!(
            job.claim(now + chrono::Duration::seconds(1)),
            Err(JobStoreError::NotReady { id: job.id, until })
        );
        assert_eq!(job.status, JobStatus::Queued);

        job.claim(until).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn wire_shape_uses_camel_case_and_enum_names() {
        let job = outline_job();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "COURSE_OUTLINE");
        assert_eq!(json["status"], "QUEUED");
        assert_eq!(json["progressPercent"], 0);
        assert!(json.get("createdByUserId").is_some());
    }
}
