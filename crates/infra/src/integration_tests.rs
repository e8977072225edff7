//! Integration tests for the full generation pipeline.
//!
//! Tests: JobStore → TaskQueue → WorkerPool → Orchestrator → ContentRepository
//!        → BatchCoordinator → NotificationFanout
//!
//! Verifies:
//! - SME ingestion populates the tenant's knowledge base
//! - Jobs created and enqueued are run to completion by the pool
//! - An approved outline fans out into lesson jobs that resolve the parent
//! - Transient provider failures are retried through the queue
//! - Work orphaned by a crashed worker is recovered by the watchdog
//! - Tenant isolation is preserved

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coursegen_ai::{GenerationKind, ProviderError};
    use coursegen_core::{CourseId, SmeTaskId, SubmissionId, TenantId, UserId};
    use coursegen_events::EventBus;

    use crate::jobs::{GenerationJob, JobFilter, JobPayload, JobStatus, JobStore, NewJob};
    use crate::notifications::{NotificationKind, NotificationStore};
    use crate::orchestrator::ContentRepository;
    use crate::orchestrator::content::lesson_path;
    use crate::queue::{EnqueueOptions, TaskQueue};
    use crate::workers::test_support::Pipeline;
    use crate::workers::{WatchdogConfig, WorkerPoolConfig, enqueue_job};

    fn pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: 4,
            poll_interval: Duration::from_millis(5),
            visibility_timeout: Duration::from_secs(30),
            provisioning_retry_delay: Duration::from_millis(5),
            enqueue: EnqueueOptions::default(),
        }
    }

    async fn settled(p: &Pipeline, tenant: TenantId, job: &GenerationJob) -> GenerationJob {
        for _ in 0..600 {
            let current = p.store.get(tenant, job.id).await.unwrap().unwrap();
            if current.status.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached a terminal state", job.id);
    }

    async fn submit(p: &Pipeline, new: NewJob) -> GenerationJob {
        let job = p.store.create(new).await.unwrap();
        enqueue_job(p.queue.as_ref(), &job, EnqueueOptions::default())
            .await
            .unwrap();
        job
    }

    fn outline_job(tenant: TenantId, user: UserId, course: CourseId) -> NewJob {
        NewJob::new(
            tenant,
            user,
            JobPayload::CourseOutline {
                course_id: course,
                brief: "Async Rust for backend engineers".into(),
            },
        )
    }

    #[tokio::test]
    async fn outline_then_full_course_runs_to_completion() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        let course = CourseId::new();
        let handle = p.pool(pool_config()).spawn();

        let outline_job = submit(&p, outline_job(tenant, user, course)).await;
        let outline_job = settled(&p, tenant, &outline_job).await;
        assert_eq!(outline_job.status, JobStatus::Completed);

        let outline = p.content.outline(tenant, course).await.unwrap().expect("outline saved");
        let lessons = outline.lesson_ids();
        assert_eq!(lessons.len(), 3);

        let started = p
            .batch
            .start_batch(tenant, user, course, lessons.clone())
            .await
            .unwrap();
        assert_eq!(started.children.len(), 3);

        let parent = settled(&p, tenant, &started.parent).await;
        let report = handle.shutdown(Duration::from_secs(2)).await;
        assert_eq!(report.abandoned, 0);

        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(parent.progress_percent, 100);

        let children = p.store.children(tenant, parent.id).await.unwrap();
        assert!(children.iter().all(|c| c.status == JobStatus::Completed));
        let child_tokens: u64 = children.iter().map(|c| c.tokens_used).sum();
        assert_eq!(parent.tokens_used, child_tokens);

        for lesson in lessons {
            assert!(p.content.document(&lesson_path(tenant, course, lesson)).is_some());
        }

        let notes = p.notifications.list_for_user(tenant, user, false, 50).await.unwrap();
        assert!(notes.iter().any(|n| n.job_id == Some(parent.id) && n.kind == NotificationKind::JobCompleted));
    }

    #[tokio::test]
    async fn sme_ingestion_feeds_the_knowledge_base() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        let submission = SubmissionId::new();
        p.knowledge
            .add_submission(tenant, submission, "Ownership moves values; borrowing lends them.");
        let handle = p.pool(pool_config()).spawn();

        let job = submit(
            &p,
            NewJob::new(
                tenant,
                UserId::new(),
                JobPayload::SmeIngestion {
                    sme_task_id: SmeTaskId::new(),
                    submission_id: submission,
                },
            ),
        )
        .await;
        let job = settled(&p, tenant, &job).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert!(p.knowledge.chunk_count(tenant) > 0);
        assert_eq!(p.knowledge.chunk_count(TenantId::new()), 0);
    }

    #[tokio::test]
    async fn transient_provider_failures_are_retried_through_the_queue() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        p.provider.fail_times(
            GenerationKind::Outline,
            2,
            ProviderError::Transient("rate limited".into()),
        );
        let handle = p.pool(pool_config()).spawn();

        let job = submit(&p, outline_job(tenant, UserId::new(), CourseId::new())).await;
        let job = settled(&p, tenant, &job).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(p.provider.call_count(GenerationKind::Outline), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job_and_notify() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        p.provider.fail_times(
            GenerationKind::Outline,
            10,
            ProviderError::Transient("upstream down".into()),
        );
        let handle = p.pool(pool_config()).spawn();

        let job = submit(&p, outline_job(tenant, user, CourseId::new()).with_max_retries(2)).await;
        let job = settled(&p, tenant, &job).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert!(job.error_message.as_deref().unwrap_or_default().contains("upstream down"));

        let notes = p.notifications.list_for_user(tenant, user, false, 10).await.unwrap();
        assert_eq!(notes.first().map(|n| n.kind), Some(NotificationKind::JobFailed));
        assert_eq!(
            notes.iter().filter(|n| n.kind == NotificationKind::JobStarted).count(),
            1
        );
    }

    #[tokio::test]
    async fn crashed_worker_job_is_recovered_by_the_watchdog() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        let job = p
            .store
            .create(outline_job(tenant, UserId::new(), CourseId::new()))
            .await
            .unwrap();
        // A worker claimed it and died.
        p.store.claim(job.id).await.unwrap();

        let report = p
            .watchdog(WatchdogConfig {
                interval: Duration::from_millis(5),
                stale_timeout: Duration::ZERO,
                enqueue: EnqueueOptions::default(),
                registration_batch: 10,
            })
            .sweep()
            .await;
        assert_eq!(report.requeued, 1);

        let handle = p.pool(pool_config()).spawn();
        let job = settled(&p, tenant, &job).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn subscribers_receive_milestones_in_order() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        let user = UserId::new();
        let subscription = p.bus.subscribe();
        let handle = p.pool(pool_config()).spawn();

        let job = submit(&p, outline_job(tenant, user, CourseId::new())).await;
        settled(&p, tenant, &job).await;
        handle.shutdown(Duration::from_secs(1)).await;

        let mut topics = Vec::new();
        while let Ok(envelope) = subscription.try_recv() {
            assert_eq!(envelope.tenant_id(), tenant);
            assert_eq!(envelope.user_id(), user);
            topics.push(envelope.topic().to_string());
        }
        assert_eq!(topics, vec!["job.started", "job.completed"]);
    }

    #[tokio::test]
    async fn tenants_never_see_each_others_jobs() {
        let p = Pipeline::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let handle = p.pool(pool_config()).spawn();

        let a = submit(&p, outline_job(tenant_a, UserId::new(), CourseId::new())).await;
        let b = submit(&p, outline_job(tenant_b, UserId::new(), CourseId::new())).await;
        settled(&p, tenant_a, &a).await;
        settled(&p, tenant_b, &b).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert!(p.store.get(tenant_b, a.id).await.unwrap().is_none());
        let listed = p.store.list(tenant_a, &JobFilter::default(), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.id);

        let depth = p.queue.depth().await.unwrap();
        assert_eq!(depth.ready + depth.in_flight + depth.dead_lettered, 0);
    }
}
