//! Postgres-backed notification store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use coursegen_core::{CourseId, NotificationId, SmeTaskId, TenantId, UserId};

use super::store::NotificationStore;
use super::types::{NewNotification, Notification, NotificationError};
use crate::jobs::JobId;

const NOTIFICATION_COLUMNS: &str = r#"
    id, tenant_id, user_id, kind, priority, title, body, read,
    job_id, course_id, task_id, sme_id, created_at, read_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresNotificationStore {
    pool: Arc<PgPool>,
}

impl PostgresNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn storage(operation: &str) -> impl Fn(sqlx::Error) -> NotificationError + '_ {
    move |e| NotificationError::Storage(format!("sqlx error in {operation}: {e}"))
}

#[async_trait::async_trait]
impl NotificationStore for PostgresNotificationStore {
    #[instrument(
        skip(self, notification),
        fields(tenant_id = %notification.tenant_id, user_id = %notification.user_id),
        err
    )]
    async fn create(&self, notification: NewNotification) -> Result<Notification, NotificationError> {
        let row = notification.into_notification(Utc::now());
        sqlx::query(&format!(
            r#"
            INSERT INTO notifications ({NOTIFICATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#
        ))
        .bind(row.id.as_uuid())
        .bind(row.tenant_id.as_uuid())
        .bind(row.user_id.as_uuid())
        .bind(row.kind.as_str())
        .bind(row.priority.as_str())
        .bind(&row.title)
        .bind(&row.body)
        .bind(row.read)
        .bind(row.job_id.map(|j| j.as_uuid()))
        .bind(row.course_id.map(|c| *c.as_uuid()))
        .bind(row.task_id.map(|t| *t.as_uuid()))
        .bind(row.sme_id.map(|s| *s.as_uuid()))
        .bind(row.created_at)
        .bind(row.read_at)
        .execute(&*self.pool)
        .await
        .map_err(storage("create_notification"))?;
        Ok(row)
    }

    #[instrument(skip(self), err)]
    async fn list_for_user(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, NotificationError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE tenant_id = $1 AND user_id = $2 AND ($3 = FALSE OR read = FALSE)
            ORDER BY created_at DESC
            LIMIT $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(unread_only)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("list_notifications"))?;

        rows.iter().map(notification_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_read(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE notifications
            SET read = TRUE, read_at = COALESCE(read_at, $4)
            WHERE id = $1 AND tenant_id = $2 AND user_id = $3
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("mark_notification_read"))?;

        match row {
            Some(row) => notification_from_row(&row),
            None => Err(NotificationError::NotFound(id)),
        }
    }

    async fn unread_count(&self, tenant_id: TenantId, user_id: UserId) -> Result<usize, NotificationError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE tenant_id = $1 AND user_id = $2 AND read = FALSE",
        )
        .bind(tenant_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage("unread_count"))?;
        Ok(count.max(0) as usize)
    }
}

fn notification_from_row(row: &PgRow) -> Result<Notification, NotificationError> {
    let read = |e: sqlx::Error| NotificationError::Storage(format!("failed to decode notification row: {e}"));
    let decode = |e: coursegen_core::DomainError| NotificationError::Storage(e.to_string());

    let kind: String = row.try_get("kind").map_err(read)?;
    let priority: String = row.try_get("priority").map_err(read)?;
    let job: Option<uuid::Uuid> = row.try_get("job_id").map_err(read)?;
    let course: Option<uuid::Uuid> = row.try_get("course_id").map_err(read)?;
    let task: Option<uuid::Uuid> = row.try_get("task_id").map_err(read)?;
    let sme: Option<uuid::Uuid> = row.try_get("sme_id").map_err(read)?;
    let read_at: Option<DateTime<Utc>> = row.try_get("read_at").map_err(read)?;

    Ok(Notification {
        id: NotificationId::from_uuid(row.try_get("id").map_err(read)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(read)?),
        kind: kind.parse().map_err(decode)?,
        priority: priority.parse().map_err(decode)?,
        title: row.try_get("title").map_err(read)?,
        body: row.try_get("body").map_err(read)?,
        read: row.try_get("read").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        read_at,
        job_id: job.map(JobId::from_uuid),
        course_id: course.map(CourseId::from_uuid),
        task_id: task.map(SmeTaskId::from_uuid),
        sme_id: sme.map(UserId::from_uuid),
    })
}
