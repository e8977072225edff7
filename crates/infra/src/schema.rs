//! Postgres schema bootstrap (idempotent).

use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS generation_jobs (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('QUEUED', 'PROCESSING', 'COMPLETED', 'FAILED', 'CANCELLED')),
        payload JSONB NOT NULL,
        progress_percent SMALLINT NOT NULL DEFAULT 0 CHECK (progress_percent BETWEEN 0 AND 100),
        progress_message TEXT NOT NULL DEFAULT '',
        result_path TEXT,
        error_message TEXT,
        tokens_used BIGINT NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        parent_job_id UUID REFERENCES generation_jobs (id),
        course_id UUID,
        lesson_id UUID,
        sme_task_id UUID,
        submission_id UUID,
        created_by_user_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        next_attempt_at TIMESTAMPTZ,
        CHECK (retry_count <= max_retries)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS generation_jobs_status_created_idx ON generation_jobs (status, created_at)",
    "CREATE INDEX IF NOT EXISTS generation_jobs_parent_idx ON generation_jobs (parent_job_id)",
    "CREATE INDEX IF NOT EXISTS generation_jobs_tenant_created_idx ON generation_jobs (tenant_id, created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS pending_registrations (
        checkout_session_id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        company_name TEXT NOT NULL,
        plan TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'paid', 'provisioning', 'failed')),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS pending_registrations_paid_idx ON pending_registrations (updated_at) WHERE status = 'paid'",
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        user_id UUID NOT NULL,
        kind TEXT NOT NULL,
        priority TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        read BOOLEAN NOT NULL DEFAULT FALSE,
        job_id UUID,
        course_id UUID,
        task_id UUID,
        sme_id UUID,
        created_at TIMESTAMPTZ NOT NULL,
        read_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS notifications_user_idx ON notifications (tenant_id, user_id, created_at DESC)",
];

/// Create tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = STATEMENTS.len(), "database schema ensured");
    Ok(())
}
