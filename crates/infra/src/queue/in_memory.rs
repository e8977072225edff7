//! In-memory task queue for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::TaskQueue;
use super::types::{
    DeadLetter, EnqueueOptions, NackOutcome, QueueDepth, QueueError, Task, TaskId, TaskKind,
    TaskPayload,
};
use crate::jobs::types::to_chrono;

#[derive(Debug)]
struct Entry {
    task: Task,
    /// Set while the task is invisible to other consumers.
    visible_again_at: Option<DateTime<Utc>>,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<TaskId, Entry>,
    dead: Vec<DeadLetter>,
    seq: u64,
}

impl State {
    /// Expired in-flight tasks become ready again, or dead-lettered when spent.
    fn reap_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<TaskId> = self
            .entries
            .values()
            .filter(|e| e.visible_again_at.is_some_and(|at| at <= now))
            .map(|e| e.task.id)
            .collect();

        for id in expired {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.task.deliveries_exhausted() {
                if let Some(entry) = self.entries.remove(&id) {
                    warn!(task_id = %id, "task dead-lettered after visibility timeout");
                    self.dead.push(DeadLetter {
                        task: entry.task,
                        reason: "visibility timeout".to_string(),
                        dead_lettered_at: now,
                    });
                }
            } else {
                entry.visible_again_at = None;
                entry.task.available_at = now;
            }
        }
    }
}

/// In-memory task queue with visibility timeouts and a dead-letter list.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
    }

    /// All ready or in-flight tasks (test visibility).
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock()
            .map(|s| s.entries.values().map(|e| e.task.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, payload: TaskPayload, opts: EnqueueOptions) -> Result<Task, QueueError> {
        let task = Task::new(payload, &opts, Utc::now());
        let mut state = self.lock()?;
        state.seq += 1;
        let seq = state.seq;
        state.entries.insert(
            task.id,
            Entry {
                task: task.clone(),
                visible_again_at: None,
                seq,
            },
        );
        debug!(task_id = %task.id, kind = task.payload.kind().as_str(), "task enqueued");
        Ok(task)
    }

    async fn dequeue(&self, kinds: &[TaskKind], visibility_timeout: Duration) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.reap_expired(now);

        let next = state
            .entries
            .values()
            .filter(|e| {
                e.visible_again_at.is_none()
                    && e.task.available_at <= now
                    && kinds.contains(&e.task.payload.kind())
            })
            .min_by_key(|e| (e.task.available_at, e.seq))
            .map(|e| e.task.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        entry.task.attempts += 1;
        entry.visible_again_at = Some(now + to_chrono(visibility_timeout));
        Ok(Some(entry.task.clone()))
    }

    async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
        self.lock()?.entries.remove(&id);
        Ok(())
    }

    async fn nack(&self, id: TaskId, reason: &str, delay: Duration) -> Result<NackOutcome, QueueError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        entry.task.last_error = Some(reason.to_string());

        if entry.task.deliveries_exhausted() {
            if let Some(entry) = state.entries.remove(&id) {
                warn!(task_id = %id, attempts = entry.task.attempts, reason, "task dead-lettered");
                state.dead.push(DeadLetter {
                    task: entry.task,
                    reason: reason.to_string(),
                    dead_lettered_at: now,
                });
            }
            return Ok(NackOutcome::DeadLettered);
        }

        let available_at = now + to_chrono(delay);
        entry.visible_again_at = None;
        entry.task.available_at = available_at;
        Ok(NackOutcome::Requeued { available_at })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.lock()?.dead.iter().take(limit).cloned().collect())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.lock()?;
        let in_flight = state
            .entries
            .values()
            .filter(|e| e.visible_again_at.is_some())
            .count();
        Ok(QueueDepth {
            ready: state.entries.len() - in_flight,
            in_flight,
            dead_lettered: state.dead.len(),
        })
    }
}
