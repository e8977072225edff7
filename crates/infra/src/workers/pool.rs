//! Fixed-size worker pool.
//!
//! Each worker loops: dequeue → claim the named job → run it through the
//! orchestrator → ack. The queue task is acked once the job store has
//! recorded a decision; retries are scheduled by the store and re-announced
//! here with a delayed task. When the queue is empty a worker falls back to
//! `claim_next` so a job whose task was lost still runs.
//!
//! Shutdown stops new dequeues immediately. Handlers already running are
//! never interrupted; they get until the deadline to finish, after which the
//! remaining workers are aborted and their jobs left to the watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::enqueue_job;
use crate::config::AppConfig;
use crate::jobs::{GenerationJob, JobStore, JobStoreError, JobType};
use crate::orchestrator::{JobRunOutcome, Orchestrator};
use crate::queue::{EnqueueOptions, NackOutcome, QueueError, Task, TaskKind, TaskPayload, TaskQueue};
use crate::registration::{ProvisioningError, ProvisioningOutcome, ProvisioningService};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    /// Redelivery delay for provisioning tasks that should be retried.
    pub provisioning_retry_delay: Duration,
    pub enqueue: EnqueueOptions,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl WorkerPoolConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval,
            visibility_timeout: config.visibility_timeout,
            provisioning_retry_delay: config.retry.base_delay,
            enqueue: EnqueueOptions::default().with_max_deliveries(config.queue_max_deliveries),
        }
    }
}

/// Jobs and tasks finished vs. left behind during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: usize,
    pub abandoned: usize,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    provisioning: Option<Arc<ProvisioningService>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("provisioning", &self.provisioning.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            orchestrator,
            provisioning: None,
        }
    }

    /// Also serve provisioning tasks.
    pub fn with_provisioning(mut self, service: Arc<ProvisioningService>) -> Self {
        self.provisioning = Some(service);
        self
    }

    /// Start `worker_count` workers on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut kinds = vec![TaskKind::Generation];
        if self.provisioning.is_some() {
            kinds.push(TaskKind::Provisioning);
        }

        let template = Worker {
            id: 0,
            capabilities: self.orchestrator.registry().job_types(),
            kinds,
            config: self.config.clone(),
            store: self.store,
            queue: self.queue,
            orchestrator: self.orchestrator,
            provisioning: self.provisioning,
            in_flight: in_flight.clone(),
        };

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count {
            let worker = Worker {
                id,
                ..template.clone()
            };
            workers.spawn(worker.run(shutdown.clone()));
        }
        info!(workers = self.config.worker_count, "worker pool started");

        WorkerPoolHandle {
            shutdown,
            workers,
            in_flight,
        }
    }
}

/// Handle to stop the pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    workers: JoinSet<()>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPoolHandle {
    /// Items currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop dequeuing, wait up to `deadline` for running handlers, then abort
    /// whatever is left.
    pub async fn shutdown(mut self, deadline: Duration) -> ShutdownReport {
        self.shutdown.cancel();
        let running = self.in_flight();
        info!(running, deadline_secs = deadline.as_secs(), "worker pool shutting down");

        let drained = tokio::time::timeout(deadline, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;

        let abandoned = if drained.is_ok() {
            0
        } else {
            let left = self.in_flight();
            warn!(abandoned = left, "shutdown deadline passed; aborting workers");
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
            left
        };

        let report = ShutdownReport {
            finished: running.saturating_sub(abandoned),
            abandoned,
        };
        info!(finished = report.finished, abandoned = report.abandoned, "worker pool stopped");
        report
    }
}

#[derive(Clone)]
struct Worker {
    id: usize,
    capabilities: Vec<JobType>,
    kinds: Vec<TaskKind>,
    config: WorkerPoolConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    provisioning: Option<Arc<ProvisioningService>>,
    in_flight: Arc<AtomicUsize>,
}

/// Counts one in-flight item for its lifetime, abort included.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        let mut idle = tokio::time::interval(self.config.poll_interval.max(Duration::from_millis(1)));
        idle.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(worker = self.id, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let worked = match self.poll_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "worker iteration failed");
                    false
                }
            };
            if worked {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = idle.tick() => {}
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    /// One unit of work. `false` when nothing was available.
    async fn poll_once(&self) -> Result<bool, WorkerError> {
        if let Some(task) = self
            .queue
            .dequeue(&self.kinds, self.config.visibility_timeout)
            .await?
        {
            let _guard = InFlight::enter(&self.in_flight);
            self.handle_task(task).await?;
            return Ok(true);
        }

        if let Some(job) = self.store.claim_next(&self.capabilities).await? {
            let _guard = InFlight::enter(&self.in_flight);
            debug!(worker = self.id, job_id = %job.id, "claimed job without a task");
            self.run_job(job).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn handle_task(&self, task: Task) -> Result<(), WorkerError> {
        match &task.payload {
            TaskPayload::Generation { job_id, job_type } => {
                let job = match self.store.claim(*job_id).await {
                    Ok(job) => job,
                    Err(JobStoreError::ConcurrencyConflict(_)) => {
                        debug!(worker = self.id, %job_id, %job_type, "job already claimed or finished; dropping task");
                        self.queue.ack(task.id).await?;
                        return Ok(());
                    }
                    Err(JobStoreError::NotReady { until, .. }) => {
                        // Early or duplicate delivery: hold it until the backoff ends.
                        let delay = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        debug!(worker = self.id, %job_id, %until, "job still backing off; rescheduling task");
                        self.queue
                            .enqueue(task.payload.clone(), self.config.enqueue.clone().with_delay(delay))
                            .await?;
                        self.queue.ack(task.id).await?;
                        return Ok(());
                    }
                    Err(JobStoreError::NotFound(_)) => {
                        warn!(worker = self.id, %job_id, "task names an unknown job; dropping task");
                        self.queue.ack(task.id).await?;
                        return Ok(());
                    }
                    Err(e) => {
                        self.nack(&task, &e.to_string(), self.config.poll_interval).await;
                        return Err(e.into());
                    }
                };

                // Left un-acked on error: redelivery finds the job PROCESSING
                // and the watchdog recovers it.
                self.run_job(job).await?;
                self.queue.ack(task.id).await?;
                Ok(())
            }
            TaskPayload::Provisioning {
                checkout_session_id,
            } => {
                let Some(service) = &self.provisioning else {
                    self.nack(&task, "worker cannot provision", self.config.poll_interval).await;
                    return Ok(());
                };

                match service.run(checkout_session_id).await {
                    Ok(outcome) => {
                        match &outcome {
                            ProvisioningOutcome::Provisioned(account) => {
                                info!(worker = self.id, checkout_session_id, tenant_id = %account.tenant_id, "provisioning task done");
                            }
                            ProvisioningOutcome::Skipped => {
                                debug!(worker = self.id, checkout_session_id, "provisioning task skipped");
                            }
                            ProvisioningOutcome::Failed(reason) => {
                                warn!(worker = self.id, checkout_session_id, %reason, "provisioning failed permanently");
                            }
                        }
                        self.queue.ack(task.id).await?;
                    }
                    Err(ProvisioningError::Retry(reason)) => {
                        self.nack(&task, &reason, self.config.provisioning_retry_delay).await;
                    }
                    Err(e) => {
                        self.nack(&task, &e.to_string(), self.config.provisioning_retry_delay).await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn run_job(&self, job: GenerationJob) -> Result<(), WorkerError> {
        let job_id = job.id;
        match self.orchestrator.execute(job).await? {
            JobRunOutcome::Requeued(job) => {
                let delay = job.backoff_remaining(Utc::now());
                if let Err(e) = enqueue_job(self.queue.as_ref(), &job, self.config.enqueue.clone().with_delay(delay)).await {
                    warn!(worker = self.id, %job_id, error = %e, "failed to enqueue retry; claim_next will pick it up");
                }
            }
            outcome => {
                debug!(worker = self.id, %job_id, ?outcome, "job run finished");
            }
        }
        Ok(())
    }

    async fn nack(&self, task: &Task, reason: &str, delay: Duration) {
        match self.queue.nack(task.id, reason, delay).await {
            Ok(NackOutcome::DeadLettered) => {
                warn!(worker = self.id, task_id = %task.id, %reason, "task dead-lettered");
            }
            Ok(NackOutcome::Requeued { available_at }) => {
                debug!(worker = self.id, task_id = %task.id, %available_at, "task requeued");
            }
            Err(e) => {
                warn!(worker = self.id, task_id = %task.id, error = %e, "nack failed; visibility timeout will redeliver");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use coursegen_core::{CourseId, TenantId, UserId};

    use super::*;
    use crate::jobs::{JobPayload, JobStatus, NewJob};
    use crate::registration::{NewRegistration, RegistrationStore};
    use crate::workers::WatchdogConfig;
    use crate::workers::test_support::Pipeline;

    fn fast_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: workers,
            poll_interval: Duration::from_millis(5),
            visibility_timeout: Duration::from_secs(30),
            provisioning_retry_delay: Duration::from_millis(5),
            enqueue: EnqueueOptions::default(),
        }
    }

    async fn wait_for<F>(p: &Pipeline, job: &GenerationJob, done: F) -> GenerationJob
    where
        F: Fn(&GenerationJob) -> bool,
    {
        for _ in 0..400 {
            let current = p.store.get(job.tenant_id, job.id).await.unwrap().unwrap();
            if done(&current) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not settle", job.id);
    }

    fn outline(tenant: TenantId) -> NewJob {
        NewJob::new(
            tenant,
            UserId::new(),
            JobPayload::CourseOutline {
                course_id: CourseId::new(),
                brief: "Traits".into(),
            },
        )
    }

    #[tokio::test]
    async fn queued_jobs_are_processed_and_tasks_acked() {
        let p = Pipeline::new();
        let tenant = TenantId::new();
        let mut jobs = Vec::new();
        for _ in 0..6 {
            let job = p.store.create(outline(tenant)).await.unwrap();
            enqueue_job(p.queue.as_ref(), &job, EnqueueOptions::default()).await.unwrap();
            jobs.push(job);
        }

        let handle = p.pool(fast_config(3)).spawn();
        for job in &jobs {
            let done = wait_for(&p, job, |j| j.status == JobStatus::Completed).await;
            assert_eq!(done.progress_percent, 100);
        }
        let report = handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.abandoned, 0);

        let depth = p.queue.depth().await.unwrap();
        assert_eq!(depth.ready + depth.in_flight, 0);
    }

    #[tokio::test]
    async fn job_without_task_is_claimed_from_the_store() {
        let p = Pipeline::new();
        let job = p.store.create(outline(TenantId::new())).await.unwrap();

        let handle = p.pool(fast_config(1)).spawn();
        wait_for(&p, &job, |j| j.status == JobStatus::Completed).await;
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn duplicate_tasks_run_the_job_once() {
        let p = Pipeline::new();
        let job = p.store.create(outline(TenantId::new())).await.unwrap();
        for _ in 0..3 {
            enqueue_job(p.queue.as_ref(), &job, EnqueueOptions::default()).await.unwrap();
        }

        let handle = p.pool(fast_config(3)).spawn();
        wait_for(&p, &job, |j| j.status == JobStatus::Completed).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(p.provider.call_count(coursegen_ai::GenerationKind::Outline), 1);
    }

    #[tokio::test]
    async fn provisioning_tasks_are_served() {
        let p = Pipeline::new();
        let registration = NewRegistration {
            checkout_session_id: "cs_pool".into(),
            email: "owner@example.com".into(),
            company_name: "Acme".into(),
            plan: "team".into(),
        }
        .into_pending(Utc::now(), chrono::Duration::hours(24));
        p.registrations.create_pending(registration).await.unwrap();
        p.registrations.mark_paid("cs_pool", Utc::now()).await.unwrap();
        p.queue
            .enqueue(
                TaskPayload::Provisioning {
                    checkout_session_id: "cs_pool".into(),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let handle = p.pool(fast_config(1)).spawn();
        for _ in 0..400 {
            if !p.provisioner.provisioned().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown(Duration::from_secs(1)).await;

        assert_eq!(p.provisioner.provisioned().len(), 1);
        assert!(p.registrations.get("cs_pool").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_a_running_handler_within_the_deadline() {
        let p = Pipeline::new();
        p.provider.set_latency(Duration::from_millis(150));
        let job = p.store.create(outline(TenantId::new())).await.unwrap();
        enqueue_job(p.queue.as_ref(), &job, EnqueueOptions::default()).await.unwrap();

        let handle = p.pool(fast_config(1)).spawn();
        wait_for(&p, &job, |j| j.status == JobStatus::Processing).await;
        assert_eq!(handle.in_flight(), 1);

        let report = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { finished: 1, abandoned: 0 });

        let done = p.store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let depth = p.queue.depth().await.unwrap();
        assert_eq!(depth.ready + depth.in_flight, 0);
    }

    #[tokio::test]
    async fn handler_past_the_deadline_is_abandoned_and_reclaimed() {
        let p = Pipeline::new();
        p.provider.set_latency(Duration::from_secs(30));
        let job = p.store.create(outline(TenantId::new())).await.unwrap();
        enqueue_job(p.queue.as_ref(), &job, EnqueueOptions::default()).await.unwrap();

        let handle = p.pool(fast_config(1)).spawn();
        wait_for(&p, &job, |j| j.status == JobStatus::Processing).await;

        let report = handle.shutdown(Duration::from_millis(20)).await;
        assert_eq!(report, ShutdownReport { finished: 0, abandoned: 1 });

        let orphan = p.store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Processing);
        assert_eq!(orphan.retry_count, 0);

        let sweep = p
            .watchdog(WatchdogConfig {
                interval: Duration::from_millis(5),
                stale_timeout: Duration::ZERO,
                enqueue: EnqueueOptions::default(),
                registration_batch: 10,
            })
            .sweep()
            .await;
        assert_eq!(sweep.requeued, 1);

        let recovered = p.store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
        assert_eq!(recovered.retry_count, 1);
    }

    #[tokio::test]
    async fn shutdown_with_nothing_running_is_immediate() {
        let p = Pipeline::new();
        let handle = p.pool(fast_config(2)).spawn();
        let report = handle.shutdown(Duration::from_millis(200)).await;
        assert_eq!(report, ShutdownReport::default());
    }
}
