//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use coursegen_core::TenantId;

use super::error::{JobStoreError, poisoned};
use super::retry::RetryPolicy;
use super::types::{
    GenerationJob, JobFilter, JobId, JobStats, JobStatus, JobType, NewJob, ParentResolution,
    Transition,
};

/// Persistence and atomic state transitions for generation jobs.
///
/// Every transition is a single conditional update: concurrent callers can
/// never both move the same job out of a given state.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a QUEUED job with zero progress.
    async fn create(&self, job: NewJob) -> Result<GenerationJob, JobStoreError>;

    /// Tenant-scoped read. Another tenant's job is reported as absent.
    async fn get(&self, tenant_id: TenantId, id: JobId) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Newest first.
    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Claim the oldest ready QUEUED job whose type is in `capabilities`.
    async fn claim_next(&self, capabilities: &[JobType]) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Claim a specific job. Losing the race yields `ConcurrencyConflict`.
    async fn claim(&self, id: JobId) -> Result<GenerationJob, JobStoreError>;

    async fn update_progress(&self, id: JobId, percent: u8, message: &str) -> Result<Transition, JobStoreError>;

    async fn complete(
        &self,
        id: JobId,
        result_path: Option<String>,
        tokens_used: u64,
    ) -> Result<Transition, JobStoreError>;

    /// Owns the retry-vs-terminal decision. `retryable == false` goes straight to FAILED.
    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<Transition, JobStoreError>;

    /// QUEUED/PROCESSING → CANCELLED, cascading to non-terminal children.
    async fn cancel(&self, tenant_id: TenantId, id: JobId) -> Result<Transition, JobStoreError>;

    /// Requeue (or fail, when the budget is spent) PROCESSING jobs older than
    /// `timeout`. Batch parents are never touched. Returns the affected jobs.
    async fn reclaim_stale(&self, timeout: Duration) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Insert a batch parent directly in PROCESSING so no worker can claim it.
    async fn create_batch_parent(&self, job: NewJob) -> Result<GenerationJob, JobStoreError>;

    /// Create all children atomically under `parent_id`.
    async fn create_children(
        &self,
        parent_id: JobId,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;

    async fn children(&self, tenant_id: TenantId, parent_id: JobId) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Conditional PROCESSING → terminal for a batch parent.
    async fn resolve_parent(
        &self,
        parent_id: JobId,
        resolution: ParentResolution,
    ) -> Result<Transition, JobStoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

/// Validate a children batch against its parent.
pub(crate) fn check_children(
    parent: &GenerationJob,
    has_children: bool,
    jobs: &[NewJob],
) -> Result<(), JobStoreError> {
    if parent.parent_job_id.is_some() {
        return Err(JobStoreError::Hierarchy(format!(
            "job {} is a child and cannot have children",
            parent.id
        )));
    }
    if has_children {
        return Err(JobStoreError::Hierarchy(format!(
            "job {} already has children",
            parent.id
        )));
    }
    if parent.status.is_terminal() {
        return Err(JobStoreError::InvalidState {
            id: parent.id,
            status: parent.status,
            operation: "create_children",
        });
    }
    for job in jobs {
        if job.tenant_id != parent.tenant_id {
            return Err(JobStoreError::Hierarchy(
                "child tenant differs from parent tenant".to_string(),
            ));
        }
        if job.payload.job_type() == JobType::FullCourse {
            return Err(JobStoreError::Hierarchy(
                "a child job cannot fan out further".to_string(),
            ));
        }
    }
    Ok(())
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
    retry: RetryPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retry,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a job verbatim. Test helper for aging `started_at` and similar.
    pub fn put(&self, job: GenerationJob) -> Result<(), JobStoreError> {
        self.jobs.write().map_err(poisoned)?.insert(job.id, job);
        Ok(())
    }

    fn with_job<F>(&self, id: JobId, f: F) -> Result<Transition, JobStoreError>
    where
        F: FnOnce(&mut GenerationJob) -> Result<bool, JobStoreError>,
    {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let applied = f(job)?;
        Ok(Transition {
            job: job.clone(),
            applied,
        })
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn has_children(jobs: &HashMap<JobId, GenerationJob>, id: JobId) -> bool {
    jobs.values().any(|j| j.parent_job_id == Some(id))
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<GenerationJob, JobStoreError> {
        let job = GenerationJob::from_new(job, Utc::now())?;
        self.jobs.write().map_err(poisoned)?.insert(job.id, job.clone());
        debug!(job_id = %job.id, job_type = %job.job_type, tenant_id = %job.tenant_id, "job created");
        Ok(job)
    }

    async fn get(&self, tenant_id: TenantId, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).filter(|j| j.tenant_id == tenant_id).cloned())
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn claim_next(&self, capabilities: &[JobType]) -> Result<Option<GenerationJob>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now) && capabilities.contains(&j.job_type))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.claim(now)?;
        Ok(Some(job.clone()))
    }

    async fn claim(&self, id: JobId) -> Result<GenerationJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.claim(Utc::now())?;
        Ok(job.clone())
    }

    async fn update_progress(&self, id: JobId, percent: u8, message: &str) -> Result<Transition, JobStoreError> {
        self.with_job(id, |job| job.record_progress(percent, message))
    }

    async fn complete(
        &self,
        id: JobId,
        result_path: Option<String>,
        tokens_used: u64,
    ) -> Result<Transition, JobStoreError> {
        self.with_job(id, |job| job.complete(result_path, tokens_used, Utc::now()))
    }

    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<Transition, JobStoreError> {
        let retry = &self.retry;
        self.with_job(id, |job| job.fail(error, retryable, retry, Utc::now()))
    }

    async fn cancel(&self, tenant_id: TenantId, id: JobId) -> Result<Transition, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let now = Utc::now();

        let job = jobs
            .get_mut(&id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or(JobStoreError::NotFound(id))?;
        let applied = job.cancel(now);
        let job = job.clone();

        if applied {
            let mut cascaded = 0;
            for child in jobs.values_mut().filter(|j| j.parent_job_id == Some(id)) {
                if child.cancel(now) {
                    cascaded += 1;
                }
            }
            info!(job_id = %id, tenant_id = %tenant_id, cascaded, "job cancelled");
        }

        Ok(Transition { job, applied })
    }

    async fn reclaim_stale(&self, timeout: Duration) -> Result<Vec<GenerationJob>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let now = Utc::now();

        let stale: Vec<JobId> = jobs
            .values()
            .filter(|j| j.is_stale(timeout, now) && !has_children(&jobs, j.id))
            .map(|j| j.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(job) = jobs.get_mut(&id) {
                if job.reclaim(timeout, now) {
                    warn!(
                        job_id = %job.id,
                        retry_count = job.retry_count,
                        status = %job.status,
                        "reclaimed stale job"
                    );
                    reclaimed.push(job.clone());
                }
            }
        }
        Ok(reclaimed)
    }

    async fn create_batch_parent(&self, job: NewJob) -> Result<GenerationJob, JobStoreError> {
        let now = Utc::now();
        let mut job = GenerationJob::from_new(job, now)?;
        job.claim(now)?;
        job.progress_message = "waiting for children".to_string();
        self.jobs.write().map_err(poisoned)?.insert(job.id, job.clone());
        Ok(job)
    }

    async fn create_children(
        &self,
        parent_id: JobId,
        new_jobs: Vec<NewJob>,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let parent = jobs
            .get(&parent_id)
            .ok_or(JobStoreError::NotFound(parent_id))?;
        check_children(parent, has_children(&jobs, parent_id), &new_jobs)?;

        let now = Utc::now();
        let children = new_jobs
            .into_iter()
            .map(|new| {
                let mut child = GenerationJob::from_new(new, now)?;
                child.parent_job_id = Some(parent_id);
                Ok(child)
            })
            .collect::<Result<Vec<_>, JobStoreError>>()?;

        for child in &children {
            jobs.insert(child.id, child.clone());
        }
        Ok(children)
    }

    async fn children(&self, tenant_id: TenantId, parent_id: JobId) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.parent_job_id == Some(parent_id))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    async fn resolve_parent(
        &self,
        parent_id: JobId,
        resolution: ParentResolution,
    ) -> Result<Transition, JobStoreError> {
        self.with_job(parent_id, |job| Ok(job.resolve(&resolution, Utc::now())))
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, job: NewJob) -> Result<GenerationJob, JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, tenant_id: TenantId, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        (**self).get(tenant_id, id).await
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        (**self).list(tenant_id, filter, limit).await
    }

    async fn claim_next(&self, capabilities: &[JobType]) -> Result<Option<GenerationJob>, JobStoreError> {
        (**self).claim_next(capabilities).await
    }

    async fn claim(&self, id: JobId) -> Result<GenerationJob, JobStoreError> {
        (**self).claim(id).await
    }

    async fn update_progress(&self, id: JobId, percent: u8, message: &str) -> Result<Transition, JobStoreError> {
        (**self).update_progress(id, percent, message).await
    }

    async fn complete(
        &self,
        id: JobId,
        result_path: Option<String>,
        tokens_used: u64,
    ) -> Result<Transition, JobStoreError> {
        (**self).complete(id, result_path, tokens_used).await
    }

    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<Transition, JobStoreError> {
        (**self).fail(id, error, retryable).await
    }

    async fn cancel(&self, tenant_id: TenantId, id: JobId) -> Result<Transition, JobStoreError> {
        (**self).cancel(tenant_id, id).await
    }

    async fn reclaim_stale(&self, timeout: Duration) -> Result<Vec<GenerationJob>, JobStoreError> {
        (**self).reclaim_stale(timeout).await
    }

    async fn create_batch_parent(&self, job: NewJob) -> Result<GenerationJob, JobStoreError> {
        (**self).create_batch_parent(job).await
    }

    async fn create_children(
        &self,
        parent_id: JobId,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        (**self).create_children(parent_id, jobs).await
    }

    async fn children(&self, tenant_id: TenantId, parent_id: JobId) -> Result<Vec<GenerationJob>, JobStoreError> {
        (**self).children(tenant_id, parent_id).await
    }

    async fn resolve_parent(
        &self,
        parent_id: JobId,
        resolution: ParentResolution,
    ) -> Result<Transition, JobStoreError> {
        (**self).resolve_parent(parent_id, resolution).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id).await
    }
}
