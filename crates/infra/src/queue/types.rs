use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{GenerationJob, JobId, JobType};

/// Default redelivery budget before a task is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task routing class. A worker dequeues only the kinds it can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Generation,
    Provisioning,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Generation, TaskKind::Provisioning];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Generation => "generation",
            TaskKind::Provisioning => "provisioning",
        }
    }
}

/// What a task points at. Tasks carry references only; the job store (or
/// registration store) holds the actual state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Generation { job_id: JobId, job_type: JobType },
    Provisioning { checkout_session_id: String },
}

impl TaskPayload {
    pub fn for_job(job: &GenerationJob) -> Self {
        TaskPayload::Generation {
            job_id: job.id,
            job_type: job.job_type,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Generation { .. } => TaskKind::Generation,
            TaskPayload::Provisioning { .. } => TaskKind::Provisioning,
        }
    }
}

/// A durable work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    /// Deliveries so far (incremented on every dequeue).
    pub attempts: u32,
    pub max_deliveries: u32,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(payload: TaskPayload, opts: &EnqueueOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            attempts: 0,
            max_deliveries: opts.max_deliveries.max(1),
            available_at: now + crate::jobs::types::to_chrono(opts.delay),
            enqueued_at: now,
            last_error: None,
        }
    }

    pub fn deliveries_exhausted(&self) -> bool {
        self.attempts >= self.max_deliveries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub max_deliveries: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

impl EnqueueOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { available_at: DateTime<Utc> },
    DeadLettered,
}

/// A task that exhausted its redelivery budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}
