use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coursegen_core::{CourseId, DomainError, NotificationId, SmeTaskId, TenantId, UserId};

use crate::jobs::{GenerationJob, JobId, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    JobStarted,
    JobCompleted,
    JobFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::JobStarted => "job_started",
            NotificationKind::JobCompleted => "job_completed",
            NotificationKind::JobFailed => "job_failed",
        }
    }

    /// Bus topic for real-time delivery.
    pub fn topic(&self) -> &'static str {
        match self {
            NotificationKind::JobStarted => "job.started",
            NotificationKind::JobCompleted => "job.completed",
            NotificationKind::JobFailed => "job.failed",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_started" => Ok(NotificationKind::JobStarted),
            "job_completed" => Ok(NotificationKind::JobCompleted),
            "job_failed" => Ok(NotificationKind::JobFailed),
            other => Err(DomainError::validation(format!("unknown notification kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
        }
    }
}

impl FromStr for NotificationPriority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(NotificationPriority::Low),
            "normal" => Ok(NotificationPriority::Normal),
            "high" => Ok(NotificationPriority::High),
            other => Err(DomainError::validation(format!("unknown notification priority: {other}"))),
        }
    }
}

/// A durable, per-user notification. Append-only apart from the read flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub job_id: Option<JobId>,
    pub course_id: Option<CourseId>,
    pub task_id: Option<SmeTaskId>,
    pub sme_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub title: String,
    pub body: String,
    pub job_id: Option<JobId>,
    pub course_id: Option<CourseId>,
    pub task_id: Option<SmeTaskId>,
    pub sme_id: Option<UserId>,
}

impl NewNotification {
    pub fn new(
        tenant_id: TenantId,
        user_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            user_id,
            kind,
            priority: NotificationPriority::default(),
            title: title.into(),
            body: body.into(),
            job_id: None,
            course_id: None,
            task_id: None,
            sme_id: None,
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Milestone notification addressed to the job's creator.
    pub fn for_job(job: &GenerationJob, milestone: Milestone) -> Self {
        let label = job_label(job.job_type);
        let (kind, priority, title, body) = match milestone {
            Milestone::Started => (
                NotificationKind::JobStarted,
                NotificationPriority::Low,
                format!("{label} started"),
                format!("Job {} is now running.", job.id),
            ),
            Milestone::Completed => (
                NotificationKind::JobCompleted,
                NotificationPriority::Normal,
                format!("{label} ready"),
                match &job.result_path {
                    Some(path) => format!("Job {} finished. Result: {path}", job.id),
                    None => format!("Job {} finished.", job.id),
                },
            ),
            Milestone::Failed => (
                NotificationKind::JobFailed,
                NotificationPriority::High,
                format!("{label} failed"),
                format!(
                    "Job {} failed: {}",
                    job.id,
                    job.error_message.as_deref().unwrap_or("unknown error")
                ),
            ),
        };

        Self {
            job_id: Some(job.id),
            course_id: job.course_id,
            task_id: job.sme_task_id,
            ..Self::new(job.tenant_id, job.created_by_user_id, kind, title, body).with_priority(priority)
        }
    }

    pub fn into_notification(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: NotificationId::new(),
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            kind: self.kind,
            priority: self.priority,
            title: self.title,
            body: self.body,
            read: false,
            created_at: now,
            read_at: None,
            job_id: self.job_id,
            course_id: self.course_id,
            task_id: self.task_id,
            sme_id: self.sme_id,
        }
    }
}

/// Job lifecycle points that produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Started,
    Completed,
    Failed,
}

fn job_label(job_type: JobType) -> &'static str {
    match job_type {
        JobType::SmeIngestion => "Knowledge ingestion",
        JobType::CourseOutline => "Course outline",
        JobType::LessonContent => "Lesson content",
        JobType::ComponentRegen => "Component regeneration",
        JobType::FullCourse => "Course generation",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationError {
    #[error("notification not found: {0}")]
    NotFound(NotificationId),

    #[error("notification storage error: {0}")]
    Storage(String),
}
