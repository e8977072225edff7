//! Job orchestration: runs a claimed job through its handler and records the
//! outcome.
//!
//! ## Design
//!
//! - Handlers are looked up in an explicit [`HandlerRegistry`] built at startup
//! - Handlers never touch terminal transitions; [`Orchestrator::execute`] does
//! - Failures are classified by [`JobError::disposition`] and routed through
//!   `JobStore::fail`, which owns the retry decision
//! - Milestone notifications and batch aggregation happen after the store
//!   transition applied, never before

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

pub mod content;
pub mod context;
pub mod error;
pub mod handlers;

pub use content::{
    ContentError, ContentRepository, CourseOutline, InMemoryContentRepository,
    InMemoryKnowledgeBase, KnowledgeBase, KnowledgeChunk, LessonBody, LessonSection,
    OutlineLesson,
};
pub use context::{Checkpoint, JobContext};
pub use error::{Disposition, JobError};
pub use handlers::{
    Collaborators, ComponentRegenHandler, CourseOutlineHandler, FullCourseHandler,
    HandlerOutcome, JobHandler, LessonContentHandler, SmeIngestionHandler,
};

use crate::batch::BatchCoordinator;
use crate::jobs::{GenerationJob, JobId, JobStatus, JobStore, JobStoreError, JobType, Transition};
use crate::notifications::{Milestone, NotificationFanout};

/// Explicit job type → handler map.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five handlers.
    pub fn standard(collab: Collaborators, batch: Arc<BatchCoordinator>) -> Self {
        let content = collab.content.clone();
        Self::new()
            .with(SmeIngestionHandler::new(collab.clone()))
            .with(CourseOutlineHandler::new(collab.clone()))
            .with(LessonContentHandler::new(collab.clone()))
            .with(ComponentRegenHandler::new(collab))
            .with(FullCourseHandler::new(content, batch))
    }

    pub fn with(mut self, handler: impl JobHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    /// Returns the handler previously registered for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Option<Arc<dyn JobHandler>> {
        self.handlers.insert(handler.job_type(), handler)
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Registered types, in `JobType::ALL` order. Used as worker capabilities.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }
}

/// What happened to a job during one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunOutcome {
    Completed(GenerationJob),
    AwaitingChildren { job: GenerationJob, children: usize },
    /// Failed with budget left; back in QUEUED until `next_attempt_at`.
    Requeued(GenerationJob),
    Failed(GenerationJob),
    Cancelled(GenerationJob),
    /// The worker no longer owns the job (reclaimed or already terminal).
    Skipped { job_id: JobId, reason: String },
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    fanout: NotificationFanout,
    batch: Arc<BatchCoordinator>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        fanout: NotificationFanout,
        batch: Arc<BatchCoordinator>,
    ) -> Self {
        Self {
            store,
            registry,
            fanout,
            batch,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn batch(&self) -> &Arc<BatchCoordinator> {
        &self.batch
    }

    /// Run a claimed (PROCESSING) job to its next resting state.
    ///
    /// Only store failures while recording the outcome surface as errors; the
    /// job then stays PROCESSING until the watchdog reclaims it.
    pub async fn execute(&self, job: GenerationJob) -> Result<JobRunOutcome, JobStoreError> {
        let job_id = job.id;
        if job.status != JobStatus::Processing {
            return Ok(JobRunOutcome::Skipped {
                job_id,
                reason: format!("job is {}", job.status),
            });
        }

        let Some(handler) = self.registry.get(job.job_type) else {
            warn!(%job_id, job_type = %job.job_type, "no handler registered");
            let msg = format!("no handler registered for {}", job.job_type);
            let transition = self.store.fail(job_id, &msg, false).await?;
            return Ok(self.after_failure(transition).await);
        };

        if job.retry_count == 0 {
            self.fanout.job_milestone(&job, Milestone::Started).await;
        }
        debug!(%job_id, job_type = %job.job_type, attempt = job.retry_count + 1, "executing job");

        let mut ctx = JobContext::new(job, self.store.clone());
        let result = handler.run(&mut ctx).await;

        match result {
            Ok(HandlerOutcome::Completed {
                result_path,
                tokens_used,
            }) => {
                let transition = match self.store.complete(job_id, result_path, tokens_used).await {
                    Ok(t) => t,
                    Err(JobStoreError::InvalidState { status, .. }) => {
                        return Ok(JobRunOutcome::Skipped {
                            job_id,
                            reason: format!("job became {status} before completion"),
                        });
                    }
                    Err(e) => return Err(e),
                };
                if !transition.applied {
                    return Ok(self.already_terminal(transition.job).await);
                }

                let job = transition.job;
                info!(%job_id, job_type = %job.job_type, tokens_used = job.tokens_used, "job completed");
                self.fanout.job_milestone(&job, Milestone::Completed).await;
                self.notify_batch(&job).await;
                Ok(JobRunOutcome::Completed(job))
            }
            Ok(HandlerOutcome::AwaitingChildren { children }) => {
                let job = ctx.job().clone();
                info!(%job_id, children, "job is waiting on its children");
                // Children may all have finished already (fast workers or a re-run).
                if let Err(e) = self.batch.refresh(job.tenant_id, job_id).await {
                    warn!(%job_id, error = %e, "batch refresh failed");
                }
                Ok(JobRunOutcome::AwaitingChildren { job, children })
            }
            Err(JobError::Cancelled) => {
                let job = ctx.job().clone();
                info!(%job_id, "job cancelled at checkpoint");
                self.notify_batch(&job).await;
                Ok(JobRunOutcome::Cancelled(job))
            }
            Err(JobError::ConcurrencyConflict(reason)) => {
                debug!(%job_id, %reason, "lost ownership of job");
                Ok(JobRunOutcome::Skipped { job_id, reason })
            }
            Err(err) => {
                let retryable = err.is_retryable();
                warn!(%job_id, error = %err, retryable, "job attempt failed");
                let transition = match self.store.fail(job_id, &err.to_string(), retryable).await {
                    Ok(t) => t,
                    Err(JobStoreError::InvalidState { status, .. }) => {
                        return Ok(JobRunOutcome::Skipped {
                            job_id,
                            reason: format!("job became {status} before failure was recorded"),
                        });
                    }
                    Err(e) => return Err(e),
                };
                Ok(self.after_failure(transition).await)
            }
        }
    }

    async fn after_failure(&self, transition: Transition) -> JobRunOutcome {
        if !transition.applied {
            return self.already_terminal(transition.job).await;
        }
        let job = transition.job;
        match job.status {
            JobStatus::Queued => {
                info!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    next_attempt_at = ?job.next_attempt_at,
                    "job requeued for retry"
                );
                JobRunOutcome::Requeued(job)
            }
            _ => {
                warn!(job_id = %job.id, error = ?job.error_message, "job failed");
                self.announce_failure(&job).await;
                JobRunOutcome::Failed(job)
            }
        }
    }

    /// Another actor (cancel, watchdog) finished the job first.
    async fn already_terminal(&self, job: GenerationJob) -> JobRunOutcome {
        match job.status {
            JobStatus::Cancelled => {
                self.notify_batch(&job).await;
                JobRunOutcome::Cancelled(job)
            }
            status => JobRunOutcome::Skipped {
                job_id: job.id,
                reason: format!("job already {status}"),
            },
        }
    }

    /// Failure milestone plus batch aggregation. Also used by the watchdog
    /// for jobs it pushed to FAILED.
    pub async fn announce_failure(&self, job: &GenerationJob) {
        self.fanout.job_milestone(job, Milestone::Failed).await;
        self.notify_batch(job).await;
    }

    /// Aggregation errors never change the child's own outcome.
    pub async fn notify_batch(&self, job: &GenerationJob) {
        if job.parent_job_id.is_none() {
            return;
        }
        if let Err(e) = self.batch.on_child_terminal(job).await {
            warn!(job_id = %job.id, parent_id = ?job.parent_job_id, error = %e, "batch aggregation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use coursegen_ai::{GenerationKind, GenerationResponse, ProviderError, ScriptedProvider};
    use coursegen_core::{CourseId, LessonId, SmeTaskId, SubmissionId, TenantId, UserId};
    use coursegen_events::InMemoryEventBus;

    use super::*;
    use crate::cache::TenantCache;
    use crate::jobs::{InMemoryJobStore, JobPayload, NewJob, RetryPolicy};
    use crate::notifications::{
        InMemoryNotificationStore, NotificationEnvelope, NotificationKind, NotificationStore,
    };
    use crate::queue::InMemoryTaskQueue;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        provider: Arc<ScriptedProvider>,
        knowledge: Arc<InMemoryKnowledgeBase>,
        content: Arc<InMemoryContentRepository>,
        notifications: Arc<InMemoryNotificationStore>,
        orchestrator: Orchestrator,
        tenant: TenantId,
        user: UserId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::with_retry_policy(RetryPolicy::fixed(
            Duration::from_millis(1),
        )));
        let provider = Arc::new(ScriptedProvider::new());
        let knowledge = Arc::new(InMemoryKnowledgeBase::new());
        let content = Arc::new(InMemoryContentRepository::new());
        let notifications = Arc::new(InMemoryNotificationStore::new());
        let fanout = NotificationFanout::new(
            notifications.clone(),
            Arc::new(InMemoryEventBus::<NotificationEnvelope>::new()),
        );
        let batch = Arc::new(BatchCoordinator::new(
            store.clone(),
            Arc::new(InMemoryTaskQueue::new()),
            fanout.clone(),
        ));
        let collab = Collaborators {
            provider: provider.clone(),
            knowledge: knowledge.clone(),
            content: content.clone(),
            cache: TenantCache::in_memory(Duration::from_secs(60)),
        };
        let registry = Arc::new(HandlerRegistry::standard(collab, batch.clone()));
        let orchestrator = Orchestrator::new(store.clone(), registry, fanout, batch);

        Fixture {
            store,
            provider,
            knowledge,
            content,
            notifications,
            orchestrator,
            tenant: TenantId::new(),
            user: UserId::new(),
        }
    }

    impl Fixture {
        async fn claimed(&self, payload: JobPayload) -> GenerationJob {
            let job = self
                .store
                .create(NewJob::new(self.tenant, self.user, payload))
                .await
                .unwrap();
            self.store.claim(job.id).await.unwrap()
        }

        async fn kinds(&self) -> Vec<NotificationKind> {
            self.notifications
                .list_for_user(self.tenant, self.user, false, 50)
                .await
                .unwrap()
                .into_iter()
                .map(|n| n.kind)
                .collect()
        }
    }

    fn outline_payload(course_id: CourseId) -> JobPayload {
        JobPayload::CourseOutline {
            course_id,
            brief: "Ownership in Rust".into(),
        }
    }

    #[test]
    fn standard_registry_covers_every_type() {
        let f = fixture();
        assert_eq!(f.orchestrator.registry().job_types(), JobType::ALL.to_vec());
    }

    #[tokio::test]
    async fn outline_job_completes_with_result_path_and_tokens() {
        let f = fixture();
        let course = CourseId::new();
        let job = f.claimed(outline_payload(course)).await;

        let outcome = f.orchestrator.execute(job).await.unwrap();
        let JobRunOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress_percent, 100);
        assert!(done.tokens_used > 0);
        assert_eq!(
            done.result_path.as_deref(),
            Some(content::outline_path(f.tenant, course).as_str())
        );

        let outline = f.content.outline(f.tenant, course).await.unwrap().unwrap();
        assert_eq!(outline.lessons.len(), 3);
        assert_eq!(
            f.kinds().await,
            vec![NotificationKind::JobCompleted, NotificationKind::JobStarted]
        );
    }

    #[tokio::test]
    async fn transient_errors_requeue_until_budget_then_fail() {
        let f = fixture();
        f.provider.fail_times(
            GenerationKind::Outline,
            4,
            ProviderError::Transient("rate limited".into()),
        );
        let course = CourseId::new();
        let mut job = f.claimed(outline_payload(course)).await;

        for attempt in 1..=3 {
            let outcome = f.orchestrator.execute(job.clone()).await.unwrap();
            let JobRunOutcome::Requeued(requeued) = outcome else {
                panic!("attempt {attempt}: expected requeue, got {outcome:?}");
            };
            assert_eq!(requeued.retry_count, attempt);
            tokio::time::sleep(Duration::from_millis(5)).await;
            job = f.store.claim(requeued.id).await.unwrap();
        }

        let outcome = f.orchestrator.execute(job).await.unwrap();
        let JobRunOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failed.retry_count, 3);
        assert!(failed.error_message.unwrap().contains("rate limited"));

        let kinds = f.kinds().await;
        assert_eq!(kinds.iter().filter(|k| **k == NotificationKind::JobStarted).count(), 1);
        assert_eq!(kinds.first(), Some(&NotificationKind::JobFailed));
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let f = fixture();
        f.provider.fail_times(
            GenerationKind::Outline,
            1,
            ProviderError::Permanent("invalid api key".into()),
        );
        let job = f.claimed(outline_payload(CourseId::new())).await;

        let outcome = f.orchestrator.execute(job).await.unwrap();
        let JobRunOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn malformed_output_is_retried() {
        let f = fixture();
        f.provider.push(
            GenerationKind::Outline,
            Ok(GenerationResponse::new(json!({ "title": "x" }), 10)),
        );
        let job = f.claimed(outline_payload(CourseId::new())).await;

        let outcome = f.orchestrator.execute(job).await.unwrap();
        assert!(matches!(outcome, JobRunOutcome::Requeued(_)));
    }

    #[tokio::test]
    async fn missing_outline_fails_lesson_job_without_retry() {
        let f = fixture();
        let job = f
            .claimed(JobPayload::LessonContent {
                course_id: CourseId::new(),
                lesson_id: LessonId::new(),
            })
            .await;

        let outcome = f.orchestrator.execute(job).await.unwrap();
        let JobRunOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failed.retry_count, 0);
        assert_eq!(f.provider.call_count(GenerationKind::LessonContent), 0);
    }

    #[tokio::test]
    async fn ingestion_stores_chunks_that_feed_later_outlines() {
        let f = fixture();
        let submission = SubmissionId::new();
        f.knowledge.add_submission(f.tenant, submission, "Ownership moves values");
        let job = f
            .claimed(JobPayload::SmeIngestion {
                sme_task_id: SmeTaskId::new(),
                submission_id: submission,
            })
            .await;

        let outcome = f.orchestrator.execute(job).await.unwrap();
        assert!(matches!(outcome, JobRunOutcome::Completed(_)));
        assert_eq!(f.knowledge.chunk_count(f.tenant), 2);

        let job = f.claimed(outline_payload(CourseId::new())).await;
        f.orchestrator.execute(job).await.unwrap();
        let outline_call = f
            .provider
            .calls()
            .into_iter()
            .find(|c| c.kind == GenerationKind::Outline)
            .unwrap();
        assert!(!outline_call.context.is_empty());
    }

    #[tokio::test]
    async fn component_regen_uses_existing_lesson() {
        let f = fixture();
        let course = CourseId::new();
        let lesson = LessonId::new();
        f.content
            .save_lesson(
                f.tenant,
                course,
                lesson,
                &LessonBody {
                    title: "Borrowing".into(),
                    sections: vec![LessonSection {
                        heading: "Rules".into(),
                        body: "One mutable or many shared".into(),
                    }],
                },
            )
            .await
            .unwrap();

        let job = f
            .claimed(JobPayload::ComponentRegen {
                course_id: course,
                lesson_id: lesson,
                component: "quiz".into(),
                instructions: Some("harder questions".into()),
            })
            .await;

        let outcome = f.orchestrator.execute(job).await.unwrap();
        let JobRunOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        let path = done.result_path.unwrap();
        assert!(path.ends_with("components/quiz.json"));
        assert!(f.content.document(&path).is_some());
    }

    #[tokio::test]
    async fn full_course_fans_out_and_waits() {
        let f = fixture();
        let course = CourseId::new();
        let outline_job = f.claimed(outline_payload(course)).await;
        f.orchestrator.execute(outline_job).await.unwrap();

        let job = f.claimed(JobPayload::FullCourse { course_id: course }).await;
        let outcome = f.orchestrator.execute(job.clone()).await.unwrap();
        let JobRunOutcome::AwaitingChildren { job: parent, children } = outcome else {
            panic!("expected fan-out, got {outcome:?}");
        };
        assert_eq!(children, 3);
        assert_eq!(parent.status, JobStatus::Processing);

        for child in f.store.children(f.tenant, job.id).await.unwrap() {
            let claimed = f.store.claim(child.id).await.unwrap();
            f.orchestrator.execute(claimed).await.unwrap();
        }

        let parent = f.store.get(f.tenant, job.id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_job_stops_at_next_checkpoint() {
        struct CancelMidway {
            store: Arc<InMemoryJobStore>,
        }

        #[async_trait::async_trait]
        impl JobHandler for CancelMidway {
            fn job_type(&self) -> JobType {
                JobType::CourseOutline
            }

            async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError> {
                ctx.advance(Checkpoint::Validated, "ok").await?;
                self.store.cancel(ctx.job().tenant_id, ctx.job().id).await?;
                ctx.advance(Checkpoint::ContextGathered, "never recorded").await?;
                Ok(HandlerOutcome::Completed {
                    result_path: None,
                    tokens_used: 0,
                })
            }
        }

        let f = fixture();
        let registry = Arc::new(HandlerRegistry::new().with(CancelMidway {
            store: f.store.clone(),
        }));
        let orchestrator = Orchestrator::new(
            f.store.clone(),
            registry,
            f.orchestrator.fanout.clone(),
            f.orchestrator.batch.clone(),
        );

        let job = f.claimed(outline_payload(CourseId::new())).await;
        let outcome = orchestrator.execute(job.clone()).await.unwrap();
        assert!(matches!(outcome, JobRunOutcome::Cancelled(_)));

        let stored = f.store.get(f.tenant, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.progress_percent, 10);
    }

    #[tokio::test]
    async fn unregistered_type_fails_permanently() {
        let f = fixture();
        let orchestrator = Orchestrator::new(
            f.store.clone(),
            Arc::new(HandlerRegistry::new()),
            f.orchestrator.fanout.clone(),
            f.orchestrator.batch.clone(),
        );
        let job = f.claimed(outline_payload(CourseId::new())).await;

        let outcome = orchestrator.execute(job).await.unwrap();
        assert!(matches!(outcome, JobRunOutcome::Failed(_)));
    }
}
