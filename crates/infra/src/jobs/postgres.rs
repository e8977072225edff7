//! Postgres-backed job store.
//!
//! Claims are single conditional statements (`UPDATE ... WHERE status =
//! 'QUEUED'`); `claim_next` picks its row with `FOR UPDATE SKIP LOCKED` so
//! concurrent workers on different machines never block on, or double-claim,
//! the same job. Every other transition locks the row (`SELECT ... FOR
//! UPDATE`), applies the shared state machine from [`GenerationJob`] and
//! writes the result back in the same transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Storage` |
//! | Database (foreign key violation) | `23503` | `Hierarchy` |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Anything else | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument, warn};

use coursegen_core::{CourseId, LessonId, SmeTaskId, SubmissionId, TenantId, UserId};

use super::error::JobStoreError;
use super::retry::RetryPolicy;
use super::store::{JobStore, check_children};
use super::types::{
    GenerationJob, JobFilter, JobId, JobStats, JobStatus, JobType, NewJob, ParentResolution,
    Transition, to_chrono,
};

const JOB_COLUMNS: &str = r#"
    id, tenant_id, job_type, status, payload, progress_percent, progress_message,
    result_path, error_message, tokens_used, retry_count, max_retries, parent_job_id,
    course_id, lesson_id, sme_task_id, submission_id, created_by_user_id,
    created_at, started_at, completed_at, next_attempt_at
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    retry: RetryPolicy,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self {
            pool: Arc::new(pool),
            retry,
        }
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Lock one row, run `f`, persist if it reported a change.
    async fn transition<F>(&self, operation: &'static str, id: JobId, f: F) -> Result<Transition, JobStoreError>
    where
        F: FnOnce(&mut GenerationJob) -> Result<bool, JobStoreError> + Send,
    {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;

        let applied = f(&mut job)?;
        if applied {
            write_state(&mut tx, &job, operation).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Transition { job, applied })
    }

    async fn insert(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        insert_job(&mut *conn, job).await
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, job_type = %job.payload.job_type()), err)]
    async fn create(&self, job: NewJob) -> Result<GenerationJob, JobStoreError> {
        let job = GenerationJob::from_new(job, Utc::now())?;
        self.insert(&job).await?;
        Ok(job)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR job_type = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND ($4::UUID IS NULL OR course_id = $4)
              AND ($5::UUID IS NULL OR parent_job_id = $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.course_id.map(|c| *c.as_uuid()))
        .bind(filter.parent_job_id.map(|p| p.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, capabilities: &[JobType]) -> Result<Option<GenerationJob>, JobStoreError> {
        let types: Vec<String> = capabilities.iter().map(|t| t.as_str().to_string()).collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE generation_jobs
            SET status = 'PROCESSING', started_at = NOW(), next_attempt_at = NULL
            WHERE id = (
                SELECT id FROM generation_jobs
                WHERE status = 'QUEUED'
                  AND job_type = ANY($1)
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            AND status = 'QUEUED'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(types)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim(&self, id: JobId) -> Result<GenerationJob, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE generation_jobs
            SET status = 'PROCESSING', started_at = NOW(), next_attempt_at = NULL
            WHERE id = $1
              AND status = 'QUEUED'
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        let current: Option<(String, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT status, next_attempt_at FROM generation_jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("claim_lookup", e))?;

        match current {
            None => Err(JobStoreError::NotFound(id)),
            Some((status, Some(until))) if status == JobStatus::Queued.as_str() && until > Utc::now() => {
                Err(JobStoreError::NotReady { id, until })
            }
            Some(_) => Err(JobStoreError::ConcurrencyConflict(id)),
        }
    }

    async fn update_progress(&self, id: JobId, percent: u8, message: &str) -> Result<Transition, JobStoreError> {
        self.transition("update_progress", id, |job| job.record_progress(percent, message))
            .await
    }

    #[instrument(skip(self, result_path), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        result_path: Option<String>,
        tokens_used: u64,
    ) -> Result<Transition, JobStoreError> {
        self.transition("complete", id, |job| job.complete(result_path, tokens_used, Utc::now()))
            .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail(&self, id: JobId, error: &str, retryable: bool) -> Result<Transition, JobStoreError> {
        let retry = self.retry.clone();
        let error = error.to_string();
        self.transition("fail", id, move |job| job.fail(&error, retryable, &retry, Utc::now()))
            .await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %id), err)]
    async fn cancel(&self, tenant_id: TenantId, id: JobId) -> Result<Transition, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id)
            .await?
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or(JobStoreError::NotFound(id))?;

        let now = Utc::now();
        let applied = job.cancel(now);
        if applied {
            write_state(&mut tx, &job, "cancel").await?;

            let cascaded = sqlx::query(
                r#"
                UPDATE generation_jobs
                SET status = 'CANCELLED', completed_at = $2, next_attempt_at = NULL
                WHERE parent_job_id = $1 AND status IN ('QUEUED', 'PROCESSING')
                "#,
            )
            .bind(id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_children", e))?
            .rows_affected();

            info!(job_id = %id, cascaded, "job cancelled");
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Transition { job, applied })
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, timeout: Duration) -> Result<Vec<GenerationJob>, JobStoreError> {
        let now = Utc::now();
        let cutoff = now - to_chrono(timeout);
        let mut tx = self.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs j
            WHERE j.status = 'PROCESSING'
              AND j.started_at < $1
              AND NOT EXISTS (SELECT 1 FROM generation_jobs c WHERE c.parent_job_id = j.id)
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale_select", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            if job.reclaim(timeout, now) {
                write_state(&mut tx, &job, "reclaim_stale").await?;
                warn!(job_id = %job.id, retry_count = job.retry_count, status = %job.status, "reclaimed stale job");
                reclaimed.push(job);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(reclaimed)
    }

    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id), err)]
    async fn create_batch_parent(&self, job: NewJob) -> Result<GenerationJob, JobStoreError> {
        let now = Utc::now();
        let mut job = GenerationJob::from_new(job, now)?;
        job.claim(now)?;
        job.progress_message = "waiting for children".to_string();
        self.insert(&job).await?;
        Ok(job)
    }

    #[instrument(skip(self, jobs), fields(parent_id = %parent_id, count = jobs.len()), err)]
    async fn create_children(
        &self,
        parent_id: JobId,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let mut tx = self.begin().await?;
        let parent = lock_job(&mut tx, parent_id)
            .await?
            .ok_or(JobStoreError::NotFound(parent_id))?;

        let has_children: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM generation_jobs WHERE parent_job_id = $1)",
        )
        .bind(parent_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("has_children", e))?;

        check_children(&parent, has_children, &jobs)?;

        let now = Utc::now();
        let mut children = Vec::with_capacity(jobs.len());
        for new in jobs {
            let mut child = GenerationJob::from_new(new, now)?;
            child.parent_job_id = Some(parent_id);
            insert_job(&mut *tx, &child).await?;
            children.push(child);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(children)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, parent_id = %parent_id), err)]
    async fn children(&self, tenant_id: TenantId, parent_id: JobId) -> Result<Vec<GenerationJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE tenant_id = $1 AND parent_job_id = $2
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(parent_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("children", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, resolution), fields(parent_id = %parent_id, status = %resolution.status), err)]
    async fn resolve_parent(
        &self,
        parent_id: JobId,
        resolution: ParentResolution,
    ) -> Result<Transition, JobStoreError> {
        self.transition("resolve_parent", parent_id, move |job| {
            Ok(job.resolve(&resolution, Utc::now()))
        })
        .await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM generation_jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status: JobStatus = status.parse()?;
            stats.add(status, n.max(0) as usize);
        }
        Ok(stats)
    }
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
) -> Result<Option<GenerationJob>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;

    row.as_ref().map(job_from_row).transpose()
}

async fn write_state(
    tx: &mut Transaction<'_, Postgres>,
    job: &GenerationJob,
    operation: &'static str,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = $2,
            progress_percent = $3,
            progress_message = $4,
            result_path = $5,
            error_message = $6,
            tokens_used = $7,
            retry_count = $8,
            started_at = $9,
            completed_at = $10,
            next_attempt_at = $11
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.progress_percent as i16)
    .bind(&job.progress_message)
    .bind(&job.result_path)
    .bind(&job.error_message)
    .bind(job.tokens_used as i64)
    .bind(job.retry_count as i32)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.next_attempt_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn insert_job(conn: &mut sqlx::PgConnection, job: &GenerationJob) -> Result<(), JobStoreError> {
    let payload = serde_json::to_value(&job.payload)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

    sqlx::query(&format!(
        r#"
        INSERT INTO generation_jobs ({JOB_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
        "#
    ))
    .bind(job.id.as_uuid())
    .bind(job.tenant_id.as_uuid())
    .bind(job.job_type.as_str())
    .bind(job.status.as_str())
    .bind(payload)
    .bind(job.progress_percent as i16)
    .bind(&job.progress_message)
    .bind(&job.result_path)
    .bind(&job.error_message)
    .bind(job.tokens_used as i64)
    .bind(job.retry_count as i32)
    .bind(job.max_retries as i32)
    .bind(job.parent_job_id.map(|p| p.as_uuid()))
    .bind(job.course_id.map(|c| *c.as_uuid()))
    .bind(job.lesson_id.map(|l| *l.as_uuid()))
    .bind(job.sme_task_id.map(|s| *s.as_uuid()))
    .bind(job.submission_id.map(|s| *s.as_uuid()))
    .bind(job.created_by_user_id.as_uuid())
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.next_attempt_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

fn job_from_row(row: &PgRow) -> Result<GenerationJob, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let job_type: String = row.try_get("job_type").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(read)?;
    let progress: i16 = row.try_get("progress_percent").map_err(read)?;
    let tokens: i64 = row.try_get("tokens_used").map_err(read)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(read)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(read)?;
    let parent: Option<uuid::Uuid> = row.try_get("parent_job_id").map_err(read)?;
    let course: Option<uuid::Uuid> = row.try_get("course_id").map_err(read)?;
    let lesson: Option<uuid::Uuid> = row.try_get("lesson_id").map_err(read)?;
    let sme_task: Option<uuid::Uuid> = row.try_get("sme_task_id").map_err(read)?;
    let submission: Option<uuid::Uuid> = row.try_get("submission_id").map_err(read)?;
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(read)?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(read)?;
    let next_attempt_at: Option<DateTime<Utc>> = row.try_get("next_attempt_at").map_err(read)?;

    Ok(GenerationJob {
        id: JobId::from_uuid(row.try_get("id").map_err(read)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read)?),
        job_type: job_type.parse()?,
        status: status.parse()?,
        payload: serde_json::from_value(payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode payload: {e}")))?,
        progress_percent: progress.clamp(0, 100) as u8,
        progress_message: row.try_get("progress_message").map_err(read)?,
        result_path: row.try_get("result_path").map_err(read)?,
        error_message: row.try_get("error_message").map_err(read)?,
        tokens_used: tokens.max(0) as u64,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        parent_job_id: parent.map(JobId::from_uuid),
        course_id: course.map(CourseId::from_uuid),
        lesson_id: lesson.map(LessonId::from_uuid),
        sme_task_id: sme_task.map(SmeTaskId::from_uuid),
        submission_id: submission.map(SubmissionId::from_uuid),
        created_by_user_id: UserId::from_uuid(row.try_get("created_by_user_id").map_err(read)?),
        created_at: row.try_get("created_at").map_err(read)?,
        started_at,
        completed_at,
        next_attempt_at,
    })
}

/// Map SQLx errors to `JobStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23503") => JobStoreError::Hierarchy(msg),
                Some("23514") => JobStoreError::Validation(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
