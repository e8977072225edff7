//! Parent/child fan-out and aggregation.
//!
//! A batch parent is created directly in PROCESSING and does no work of its
//! own. Children are plain LESSON_CONTENT jobs pointing at it through
//! `parent_job_id`. Every time a child reaches a terminal state the
//! coordinator re-reads all siblings and, when the policy says so, resolves
//! the parent with a conditional update. Two children finishing at once can
//! both evaluate the aggregate; only one `resolve_parent` applies.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use coursegen_core::{CourseId, DomainError, LessonId, TenantId, UserId};

use crate::jobs::{
    DEFAULT_MAX_RETRIES, GenerationJob, JobId, JobPayload, JobStatus, JobStore, JobStoreError,
    NewJob, ParentResolution,
};
use crate::notifications::{Milestone, NotificationFanout};
use crate::queue::{EnqueueOptions, QueueError, TaskPayload, TaskQueue};

/// How a parent reacts to failed children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// First FAILED child fails the parent; remaining siblings are cancelled.
    #[default]
    FailFast,
    /// Wait for every child; any completed child completes the parent.
    BestEffort,
}

impl AggregationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPolicy::FailFast => "fail_fast",
            AggregationPolicy::BestEffort => "best_effort",
        }
    }
}

impl std::fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(AggregationPolicy::FailFast),
            "best_effort" => Ok(AggregationPolicy::BestEffort),
            other => Err(DomainError::validation(format!(
                "unknown aggregation policy: {other}"
            ))),
        }
    }
}

/// Verdict over a set of children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    Pending { completed: usize, total: usize },
    Resolve(ParentResolution),
}

/// Pure aggregation over the current child states.
pub fn aggregate(children: &[GenerationJob], policy: AggregationPolicy) -> Aggregate {
    let total = children.len();
    let count = |status: JobStatus| children.iter().filter(|c| c.status == status).count();
    let completed = count(JobStatus::Completed);
    let failed = count(JobStatus::Failed);
    let cancelled = count(JobStatus::Cancelled);
    let tokens_used: u64 = children.iter().map(|c| c.tokens_used).sum();
    let all_terminal = completed + failed + cancelled == total;

    if total == 0 {
        return Aggregate::Pending { completed, total };
    }

    let resolve = |status: JobStatus, message: String| {
        Aggregate::Resolve(ParentResolution {
            status,
            message,
            tokens_used,
        })
    };

    match policy {
        AggregationPolicy::FailFast => {
            if failed > 0 {
                resolve(
                    JobStatus::Failed,
                    format!("{failed} of {total} lessons failed"),
                )
            } else if completed == total {
                resolve(
                    JobStatus::Completed,
                    format!("{completed} of {total} lessons completed"),
                )
            } else if all_terminal {
                resolve(
                    JobStatus::Cancelled,
                    format!("batch cancelled with {completed} of {total} lessons completed"),
                )
            } else {
                Aggregate::Pending { completed, total }
            }
        }
        AggregationPolicy::BestEffort => {
            if !all_terminal {
                Aggregate::Pending { completed, total }
            } else if completed > 0 {
                resolve(
                    JobStatus::Completed,
                    format!("{completed} of {total} lessons completed"),
                )
            } else if failed > 0 {
                resolve(
                    JobStatus::Failed,
                    format!("{failed} of {total} lessons failed"),
                )
            } else {
                resolve(
                    JobStatus::Cancelled,
                    format!("batch cancelled with 0 of {total} lessons completed"),
                )
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Parent plus its children, as created.
#[derive(Debug, Clone)]
pub struct BatchStart {
    pub parent: GenerationJob,
    pub children: Vec<GenerationJob>,
}

pub struct BatchCoordinator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    fanout: NotificationFanout,
    policy: AggregationPolicy,
    enqueue: EnqueueOptions,
    max_retries: u32,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("policy", &self.policy)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        fanout: NotificationFanout,
    ) -> Self {
        Self {
            store,
            queue,
            fanout,
            policy: AggregationPolicy::default(),
            enqueue: EnqueueOptions::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_enqueue_options(mut self, opts: EnqueueOptions) -> Self {
        self.enqueue = opts;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Outline approval: a new parent with one LESSON_CONTENT child per lesson.
    pub async fn start_batch(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        course_id: CourseId,
        lesson_ids: Vec<LessonId>,
    ) -> Result<BatchStart, BatchError> {
        check_lessons(&lesson_ids)?;

        let parent = self
            .store
            .create_batch_parent(
                NewJob::new(tenant_id, user_id, JobPayload::FullCourse { course_id })
                    .with_max_retries(self.max_retries),
            )
            .await?;
        info!(parent_id = %parent.id, %tenant_id, %course_id, lessons = lesson_ids.len(), "batch started");

        self.fanout.job_milestone(&parent, Milestone::Started).await;
        let children = self.fan_out(&parent, lesson_ids).await?;

        Ok(BatchStart { parent, children })
    }

    /// Create and enqueue children under `parent`. Re-running returns the
    /// existing children instead of creating a second set.
    pub async fn fan_out(
        &self,
        parent: &GenerationJob,
        lesson_ids: Vec<LessonId>,
    ) -> Result<Vec<GenerationJob>, BatchError> {
        let JobPayload::FullCourse { course_id } = parent.payload else {
            return Err(BatchError::Validation(format!(
                "job {} is {}, only FULL_COURSE jobs fan out",
                parent.id, parent.job_type
            )));
        };

        let existing = self.store.children(parent.tenant_id, parent.id).await?;
        if !existing.is_empty() {
            debug!(parent_id = %parent.id, children = existing.len(), "fan-out already done");
            self.enqueue_queued(&existing).await;
            return Ok(existing);
        }

        check_lessons(&lesson_ids)?;
        let total = lesson_ids.len();
        let jobs = lesson_ids
            .into_iter()
            .map(|lesson_id| {
                NewJob::new(
                    parent.tenant_id,
                    parent.created_by_user_id,
                    JobPayload::LessonContent {
                        course_id,
                        lesson_id,
                    },
                )
                .with_max_retries(self.max_retries)
            })
            .collect();

        let children = match self.store.create_children(parent.id, jobs).await {
            Ok(children) => children,
            // Lost a race with a concurrent fan-out of the same parent.
            Err(JobStoreError::Hierarchy(msg)) => {
                let existing = self.store.children(parent.tenant_id, parent.id).await?;
                if existing.is_empty() {
                    return Err(JobStoreError::Hierarchy(msg).into());
                }
                return Ok(existing);
            }
            Err(e) => return Err(e.into()),
        };

        self.enqueue_queued(&children).await;
        if let Err(e) = self
            .store
            .update_progress(parent.id, 0, &format!("0 of {total} lessons completed"))
            .await
        {
            warn!(parent_id = %parent.id, error = %e, "failed to record batch progress");
        }

        info!(parent_id = %parent.id, children = children.len(), "batch fanned out");
        Ok(children)
    }

    /// Hook for every child that reached a terminal state.
    pub async fn on_child_terminal(
        &self,
        child: &GenerationJob,
    ) -> Result<Option<GenerationJob>, BatchError> {
        match child.parent_job_id {
            Some(parent_id) => self.refresh(child.tenant_id, parent_id).await,
            None => Ok(None),
        }
    }

    /// Re-evaluate a parent. Returns the parent when this call resolved it.
    pub async fn refresh(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Option<GenerationJob>, BatchError> {
        let children = self.store.children(tenant_id, parent_id).await?;

        let resolution = match aggregate(&children, self.policy) {
            Aggregate::Pending { completed, total } => {
                if total > 0 {
                    let percent = (completed * 100 / total) as u8;
                    let message = format!("{completed} of {total} lessons completed");
                    match self.store.update_progress(parent_id, percent, &message).await {
                        Ok(_) | Err(JobStoreError::InvalidState { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                return Ok(None);
            }
            Aggregate::Resolve(resolution) => resolution,
        };

        let transition = self.store.resolve_parent(parent_id, resolution).await?;
        if !transition.applied {
            return Ok(None);
        }

        let parent = transition.job;
        info!(
            parent_id = %parent.id,
            %tenant_id,
            status = %parent.status,
            policy = %self.policy,
            message = %parent.progress_message,
            "batch resolved"
        );

        if parent.status == JobStatus::Failed && self.policy == AggregationPolicy::FailFast {
            for sibling in children.iter().filter(|c| !c.status.is_terminal()) {
                if let Err(e) = self.store.cancel(tenant_id, sibling.id).await {
                    warn!(job_id = %sibling.id, parent_id = %parent.id, error = %e, "failed to cancel sibling");
                }
            }
        }

        match parent.status {
            JobStatus::Completed => self.fanout.job_milestone(&parent, Milestone::Completed).await,
            JobStatus::Failed => self.fanout.job_milestone(&parent, Milestone::Failed).await,
            _ => {}
        }

        Ok(Some(parent))
    }

    async fn enqueue_queued(&self, jobs: &[GenerationJob]) {
        let now = Utc::now();
        for job in jobs.iter().filter(|j| j.status == JobStatus::Queued) {
            // The store stays authoritative; workers fall back to claim_next.
            let options = self.enqueue.clone().with_delay(job.backoff_remaining(now));
            if let Err(e) = self.queue.enqueue(TaskPayload::for_job(job), options).await
            {
                warn!(job_id = %job.id, error = %e, "failed to enqueue child task");
            }
        }
    }
}

fn check_lessons(lesson_ids: &[LessonId]) -> Result<(), BatchError> {
    if lesson_ids.is_empty() {
        return Err(BatchError::Validation(
            "a batch needs at least one lesson".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = lesson_ids.iter().find(|l| !seen.insert(**l)) {
        return Err(BatchError::Validation(format!("lesson {dup} listed twice")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use coursegen_events::InMemoryEventBus;

    use super::*;
    use crate::jobs::InMemoryJobStore;
    use crate::notifications::{InMemoryNotificationStore, NotificationStore};
    use crate::queue::{InMemoryTaskQueue, TaskKind};
    use std::time::Duration;

    fn child(status: JobStatus, tokens: u64) -> GenerationJob {
        let new = NewJob::new(
            TenantId::new(),
            UserId::new(),
            JobPayload::LessonContent {
                course_id: CourseId::new(),
                lesson_id: LessonId::new(),
            },
        );
        let mut job = GenerationJob::from_new(new, Utc::now()).unwrap();
        job.status = status;
        job.tokens_used = tokens;
        job
    }

    fn statuses(list: &[JobStatus]) -> Vec<GenerationJob> {
        list.iter().map(|s| child(*s, 10)).collect()
    }

    #[test]
    fn fail_fast_resolves_on_first_failure() {
        use JobStatus::*;
        let children = statuses(&[Completed, Failed, Processing, Queued, Queued]);
        let Aggregate::Resolve(r) = aggregate(&children, AggregationPolicy::FailFast) else {
            panic!("expected resolution");
        };
        assert_eq!(r.status, Failed);
        assert_eq!(r.tokens_used, 50);
    }

    #[test]
    fn all_completed_completes_under_both_policies() {
        let children = statuses(&[JobStatus::Completed; 5]);
        for policy in [AggregationPolicy::FailFast, AggregationPolicy::BestEffort] {
            let Aggregate::Resolve(r) = aggregate(&children, policy) else {
                panic!("expected resolution");
            };
            assert_eq!(r.status, JobStatus::Completed);
            assert_eq!(r.message, "5 of 5 lessons completed");
        }
    }

    #[test]
    fn four_of_five_is_still_pending() {
        use JobStatus::*;
        let children = statuses(&[Completed, Completed, Completed, Completed, Processing]);
        assert_eq!(
            aggregate(&children, AggregationPolicy::FailFast),
            Aggregate::Pending {
                completed: 4,
                total: 5
            }
        );
    }

    #[test]
    fn best_effort_waits_then_keeps_partial_results() {
        use JobStatus::*;
        let running = statuses(&[Completed, Failed, Processing]);
        assert!(matches!(
            aggregate(&running, AggregationPolicy::BestEffort),
            Aggregate::Pending { .. }
        ));

        let done = statuses(&[Completed, Failed, Completed]);
        let Aggregate::Resolve(r) = aggregate(&done, AggregationPolicy::BestEffort) else {
            panic!("expected resolution");
        };
        assert_eq!(r.status, Completed);
        assert_eq!(r.message, "2 of 3 lessons completed");

        let all_failed = statuses(&[Failed, Failed]);
        let Aggregate::Resolve(r) = aggregate(&all_failed, AggregationPolicy::BestEffort) else {
            panic!("expected resolution");
        };
        assert_eq!(r.status, Failed);
    }

    #[test]
    fn cancelled_set_cancels_parent() {
        use JobStatus::*;
        let children = statuses(&[Cancelled, Cancelled]);
        for policy in [AggregationPolicy::FailFast, AggregationPolicy::BestEffort] {
            let Aggregate::Resolve(r) = aggregate(&children, policy) else {
                panic!("expected resolution");
            };
            assert_eq!(r.status, Cancelled);
        }
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("fail_fast".parse::<AggregationPolicy>().unwrap(), AggregationPolicy::FailFast);
        assert_eq!("Best-Effort".parse::<AggregationPolicy>().unwrap(), AggregationPolicy::BestEffort);
        assert!("eventually".parse::<AggregationPolicy>().is_err());
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryTaskQueue>,
        notifications: Arc<InMemoryNotificationStore>,
        batch: BatchCoordinator,
    }

    fn harness(policy: AggregationPolicy) -> Harness {
        let store = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let notifications = Arc::new(InMemoryNotificationStore::new());
        let fanout = NotificationFanout::new(
            notifications.clone(),
            Arc::new(InMemoryEventBus::<crate::notifications::NotificationEnvelope>::new()),
        );
        let batch = BatchCoordinator::new(store.clone(), queue.clone(), fanout).with_policy(policy);
        Harness {
            store,
            queue,
            notifications,
            batch,
        }
    }

    async fn run_child(h: &Harness, child: &GenerationJob, succeed: bool) -> GenerationJob {
        h.store.claim(child.id).await.unwrap();
        let t = if succeed {
            h.store.complete(child.id, Some("x".into()), 5).await.unwrap()
        } else {
            h.store.fail(child.id, "bad key", false).await.unwrap()
        };
        h.batch.on_child_terminal(&t.job).await.unwrap();
        t.job
    }

    #[tokio::test]
    async fn approving_five_lessons_creates_five_children_under_one_parent() {
        let h = harness(AggregationPolicy::FailFast);
        let lessons: Vec<LessonId> = (0..5).map(|_| LessonId::new()).collect();

        let start = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), lessons)
            .await
            .unwrap();

        assert_eq!(start.parent.status, JobStatus::Processing);
        assert_eq!(start.children.len(), 5);
        for child in &start.children {
            assert_eq!(child.parent_job_id, Some(start.parent.id));
            assert_eq!(child.status, JobStatus::Queued);
            let grandchildren = h.store.children(child.tenant_id, child.id).await.unwrap();
            assert!(grandchildren.is_empty());
        }
        assert_eq!(h.queue.depth().await.unwrap().ready, 5);
    }

    #[tokio::test]
    async fn fan_out_twice_returns_the_same_children() {
        let h = harness(AggregationPolicy::FailFast);
        let lessons = vec![LessonId::new(), LessonId::new()];
        let start = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), lessons.clone())
            .await
            .unwrap();

        let again = h.batch.fan_out(&start.parent, lessons).await.unwrap();
        let first: HashSet<_> = start.children.iter().map(|c| c.id).collect();
        let second: HashSet<_> = again.iter().map(|c| c.id).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn re_fan_out_holds_tasks_for_children_in_backoff() {
        let h = harness(AggregationPolicy::FailFast);
        let lessons = vec![LessonId::new()];
        let start = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), lessons.clone())
            .await
            .unwrap();
        let initial = h.queue.dequeue(&[TaskKind::Generation], Duration::from_secs(30)).await.unwrap().unwrap();
        h.queue.ack(initial.id).await.unwrap();

        let child = &start.children[0];
        h.store.claim(child.id).await.unwrap();
        let requeued = h.store.fail(child.id, "rate limited", true).await.unwrap().job;
        assert!(requeued.backoff_remaining(Utc::now()) > Duration::ZERO);

        h.batch.fan_out(&start.parent, lessons).await.unwrap();

        assert_eq!(h.queue.depth().await.unwrap().ready, 1);
        assert!(h
            .queue
            .dequeue(&[TaskKind::Generation], Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn parent_completes_only_after_the_last_child() {
        let h = harness(AggregationPolicy::FailFast);
        let lessons: Vec<LessonId> = (0..5).map(|_| LessonId::new()).collect();
        let start = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), lessons)
            .await
            .unwrap();
        let parent_id = start.parent.id;
        let tenant = start.parent.tenant_id;

        for child in &start.children[..4] {
            run_child(&h, child, true).await;
        }
        let parent = h.store.get(tenant, parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Processing);
        assert_eq!(parent.progress_percent, 80);

        run_child(&h, &start.children[4], true).await;
        let parent = h.store.get(tenant, parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(parent.tokens_used, 25);

        let inbox = h
            .notifications
            .list_for_user(tenant, start.parent.created_by_user_id, false, 10)
            .await
            .unwrap();
        assert!(inbox.iter().any(|n| n.job_id == Some(parent_id)));
    }

    #[tokio::test]
    async fn fail_fast_cancels_remaining_siblings() {
        let h = harness(AggregationPolicy::FailFast);
        let lessons: Vec<LessonId> = (0..3).map(|_| LessonId::new()).collect();
        let start = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), lessons)
            .await
            .unwrap();
        let tenant = start.parent.tenant_id;

        run_child(&h, &start.children[0], false).await;

        let parent = h.store.get(tenant, start.parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Failed);
        for sibling in &start.children[1..] {
            let s = h.store.get(tenant, sibling.id).await.unwrap().unwrap();
            assert_eq!(s.status, JobStatus::Cancelled);
        }

        // Late sibling events do not touch the resolved parent.
        assert!(h.batch.refresh(tenant, start.parent.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn best_effort_completes_with_partial_results() {
        let h = harness(AggregationPolicy::BestEffort);
        let lessons: Vec<LessonId> = (0..3).map(|_| LessonId::new()).collect();
        let start = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), lessons)
            .await
            .unwrap();
        let tenant = start.parent.tenant_id;

        run_child(&h, &start.children[0], false).await;
        run_child(&h, &start.children[1], true).await;
        let parent = h.store.get(tenant, start.parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Processing);

        run_child(&h, &start.children[2], true).await;
        let parent = h.store.get(tenant, start.parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(parent.progress_message, "2 of 3 lessons completed");
    }

    #[tokio::test]
    async fn empty_or_duplicate_lessons_are_rejected() {
        let h = harness(AggregationPolicy::FailFast);
        let err = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Validation(_)));

        let lesson = LessonId::new();
        let err = h
            .batch
            .start_batch(TenantId::new(), UserId::new(), CourseId::new(), vec![lesson, lesson])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Validation(_)));
        assert_eq!(h.queue.depth().await.unwrap().ready, 0);
    }
}
