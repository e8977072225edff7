//! Postgres-backed registration store.
//!
//! Status changes are single `UPDATE ... WHERE status = $expected`
//! statements; the affected-row count tells the caller whether it won.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use super::store::RegistrationStore;
use super::types::{PendingRegistration, RegistrationError, RegistrationStatus};

const REGISTRATION_COLUMNS: &str = r#"
    checkout_session_id, email, company_name, plan, status, last_error,
    created_at, updated_at, expires_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresRegistrationStore {
    pool: Arc<PgPool>,
}

impl PostgresRegistrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error, id: &str) -> RegistrationError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => return RegistrationError::Duplicate(id.to_string()),
            Some("23514") => {
                return RegistrationError::Validation(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ));
            }
            _ => {}
        }
    }
    RegistrationError::Storage(format!("sqlx error in {operation}: {err}"))
}

#[async_trait::async_trait]
impl RegistrationStore for PostgresRegistrationStore {
    #[instrument(skip(self, registration), fields(checkout_session_id = %registration.checkout_session_id), err)]
    async fn create_pending(&self, registration: PendingRegistration) -> Result<(), RegistrationError> {
        sqlx::query(&format!(
            "INSERT INTO pending_registrations ({REGISTRATION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(&registration.checkout_session_id)
        .bind(&registration.email)
        .bind(&registration.company_name)
        .bind(&registration.plan)
        .bind(registration.status.as_str())
        .bind(&registration.last_error)
        .bind(registration.created_at)
        .bind(registration.updated_at)
        .bind(registration.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_pending", e, &registration.checkout_session_id))?;
        Ok(())
    }

    async fn get(&self, checkout_session_id: &str) -> Result<Option<PendingRegistration>, RegistrationError> {
        let row = sqlx::query(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM pending_registrations WHERE checkout_session_id = $1"
        ))
        .bind(checkout_session_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_registration", e, checkout_session_id))?;

        row.as_ref().map(registration_from_row).transpose()
    }

    #[instrument(skip(self, error), err)]
    async fn compare_and_set(
        &self,
        checkout_session_id: &str,
        expected: RegistrationStatus,
        next: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<bool, RegistrationError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_registrations
            SET status = $3, updated_at = $4, last_error = COALESCE($5, last_error)
            WHERE checkout_session_id = $1 AND status = $2
            "#,
        )
        .bind(checkout_session_id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(Utc::now())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set", e, checkout_session_id))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn mark_paid(&self, checkout_session_id: &str, now: DateTime<Utc>) -> Result<bool, RegistrationError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_registrations
            SET status = 'paid', updated_at = $2
            WHERE checkout_session_id = $1 AND status = 'pending' AND expires_at > $2
            "#,
        )
        .bind(checkout_session_id)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_paid", e, checkout_session_id))?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish(&self, checkout_session_id: &str) -> Result<(), RegistrationError> {
        sqlx::query("DELETE FROM pending_registrations WHERE checkout_session_id = $1")
            .bind(checkout_session_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish_registration", e, checkout_session_id))?;
        Ok(())
    }

    async fn list_paid_unprovisioned(&self, limit: usize) -> Result<Vec<PendingRegistration>, RegistrationError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REGISTRATION_COLUMNS}
            FROM pending_registrations
            WHERE status = 'paid'
            ORDER BY updated_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_paid_unprovisioned", e, "*"))?;

        rows.iter().map(registration_from_row).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistrationError> {
        let result = sqlx::query("DELETE FROM pending_registrations WHERE status = 'pending' AND expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e, "*"))?;

        let purged = result.rows_affected() as usize;
        if purged > 0 {
            info!(purged, "purged expired pending registrations");
        }
        Ok(purged)
    }
}

fn registration_from_row(row: &PgRow) -> Result<PendingRegistration, RegistrationError> {
    let read = |e: sqlx::Error| RegistrationError::Storage(format!("failed to decode registration row: {e}"));
    let status: String = row.try_get("status").map_err(read)?;

    Ok(PendingRegistration {
        checkout_session_id: row.try_get("checkout_session_id").map_err(read)?,
        email: row.try_get("email").map_err(read)?,
        company_name: row.try_get("company_name").map_err(read)?,
        plan: row.try_get("plan").map_err(read)?,
        status: status.parse()?,
        last_error: row.try_get("last_error").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
        expires_at: row.try_get("expires_at").map_err(read)?,
    })
}
