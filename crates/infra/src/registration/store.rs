use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::types::{PendingRegistration, RegistrationError, RegistrationStatus};

/// Idempotency guard for checkout-driven provisioning.
///
/// Status changes go through [`RegistrationStore::compare_and_set`], which
/// only applies when the stored status still equals `expected`. Duplicate
/// webhook deliveries therefore race on one conditional write and exactly
/// one of them wins.
#[async_trait::async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn create_pending(&self, registration: PendingRegistration) -> Result<(), RegistrationError>;

    async fn get(&self, checkout_session_id: &str) -> Result<Option<PendingRegistration>, RegistrationError>;

    /// `true` when the row moved from `expected` to `next`.
    async fn compare_and_set(
        &self,
        checkout_session_id: &str,
        expected: RegistrationStatus,
        next: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<bool, RegistrationError>;

    /// Remove a provisioned registration.
    async fn finish(&self, checkout_session_id: &str) -> Result<(), RegistrationError>;

    /// Paid registrations whose provisioning never started, oldest first.
    async fn list_paid_unprovisioned(&self, limit: usize) -> Result<Vec<PendingRegistration>, RegistrationError>;

    /// Delete pending rows past `expires_at`. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistrationError>;

    /// Pending to paid, only while `expires_at > now`. Expiry is part of the
    /// same conditional write so a purge cannot interleave with it.
    async fn mark_paid(&self, checkout_session_id: &str, now: DateTime<Utc>) -> Result<bool, RegistrationError>;

    async fn begin_provisioning(&self, checkout_session_id: &str) -> Result<bool, RegistrationError> {
        self.compare_and_set(
            checkout_session_id,
            RegistrationStatus::Paid,
            RegistrationStatus::Provisioning,
            None,
        )
        .await
    }

    async fn mark_failed(&self, checkout_session_id: &str, error: &str) -> Result<bool, RegistrationError> {
        self.compare_and_set(
            checkout_session_id,
            RegistrationStatus::Provisioning,
            RegistrationStatus::Failed,
            Some(error),
        )
        .await
    }
}

#[async_trait::async_trait]
impl<S> RegistrationStore for Arc<S>
where
    S: RegistrationStore + ?Sized,
{
    async fn create_pending(&self, registration: PendingRegistration) -> Result<(), RegistrationError> {
        (**self).create_pending(registration).await
    }

    async fn get(&self, checkout_session_id: &str) -> Result<Option<PendingRegistration>, RegistrationError> {
        (**self).get(checkout_session_id).await
    }

    async fn compare_and_set(
        &self,
        checkout_session_id: &str,
        expected: RegistrationStatus,
        next: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<bool, RegistrationError> {
        (**self)
            .compare_and_set(checkout_session_id, expected, next, error)
            .await
    }

    async fn mark_paid(&self, checkout_session_id: &str, now: DateTime<Utc>) -> Result<bool, RegistrationError> {
        (**self).mark_paid(checkout_session_id, now).await
    }

    async fn finish(&self, checkout_session_id: &str) -> Result<(), RegistrationError> {
        (**self).finish(checkout_session_id).await
    }

    async fn list_paid_unprovisioned(&self, limit: usize) -> Result<Vec<PendingRegistration>, RegistrationError> {
        (**self).list_paid_unprovisioned(limit).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistrationError> {
        (**self).purge_expired(now).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRegistrationStore {
    rows: Mutex<HashMap<String, PendingRegistration>>,
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingRegistration>>, RegistrationError> {
        self.rows
            .lock()
            .map_err(|_| RegistrationError::Storage("registration store lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn create_pending(&self, registration: PendingRegistration) -> Result<(), RegistrationError> {
        let mut rows = self.rows()?;
        if rows.contains_key(&registration.checkout_session_id) {
            return Err(RegistrationError::Duplicate(registration.checkout_session_id));
        }
        rows.insert(registration.checkout_session_id.clone(), registration);
        Ok(())
    }

    async fn get(&self, checkout_session_id: &str) -> Result<Option<PendingRegistration>, RegistrationError> {
        Ok(self.rows()?.get(checkout_session_id).cloned())
    }

    async fn compare_and_set(
        &self,
        checkout_session_id: &str,
        expected: RegistrationStatus,
        next: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<bool, RegistrationError> {
        let mut rows = self.rows()?;
        let Some(row) = rows.get_mut(checkout_session_id) else {
            return Ok(false);
        };
        if row.status != expected {
            return Ok(false);
        }
        row.status = next;
        row.updated_at = Utc::now();
        if let Some(error) = error {
            row.last_error = Some(error.to_string());
        }
        Ok(true)
    }

    async fn mark_paid(&self, checkout_session_id: &str, now: DateTime<Utc>) -> Result<bool, RegistrationError> {
        let mut rows = self.rows()?;
        let Some(row) = rows.get_mut(checkout_session_id) else {
            return Ok(false);
        };
        if row.status != RegistrationStatus::Pending || row.expires_at <= now {
            return Ok(false);
        }
        row.status = RegistrationStatus::Paid;
        row.updated_at = now;
        Ok(true)
    }

    async fn finish(&self, checkout_session_id: &str) -> Result<(), RegistrationError> {
        self.rows()?.remove(checkout_session_id);
        Ok(())
    }

    async fn list_paid_unprovisioned(&self, limit: usize) -> Result<Vec<PendingRegistration>, RegistrationError> {
        let rows = self.rows()?;
        let mut paid: Vec<PendingRegistration> = rows
            .values()
            .filter(|r| r.status == RegistrationStatus::Paid)
            .cloned()
            .collect();
        paid.sort_by_key(|r| r.updated_at);
        paid.truncate(limit);
        Ok(paid)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, RegistrationError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|_, r| !r.is_expired(now));
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::NewRegistration;

    fn pending(id: &str, ttl_hours: i64) -> PendingRegistration {
        NewRegistration {
            checkout_session_id: id.into(),
            email: "owner@example.com".into(),
            company_name: "Acme".into(),
            plan: "team".into(),
        }
        .into_pending(Utc::now(), chrono::Duration::hours(ttl_hours))
    }

    #[tokio::test]
    async fn mark_paid_applies_exactly_once() {
        let store = Arc::new(InMemoryRegistrationStore::new());
        store.create_pending(pending("cs_1", 24)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.mark_paid("cs_1", Utc::now()).await.unwrap() }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(
            store.get("cs_1").await.unwrap().unwrap().status,
            RegistrationStatus::Paid
        );
    }

    #[tokio::test]
    async fn mark_paid_refuses_an_expired_registration() {
        let store = InMemoryRegistrationStore::new();
        store.create_pending(pending("cs_old", 1)).await.unwrap();
        let expires_at = store.get("cs_old").await.unwrap().unwrap().expires_at;

        assert!(!store.mark_paid("cs_old", expires_at).await.unwrap());
        let row = store.get("cs_old").await.unwrap().unwrap();
        assert_eq!(row.status, RegistrationStatus::Pending);
        assert!(row.is_expired(expires_at));

        assert!(store.mark_paid("cs_old", expires_at - chrono::Duration::seconds(1)).await.unwrap());
        assert!(!store.mark_paid("missing", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryRegistrationStore::new();
        store.create_pending(pending("cs_1", 24)).await.unwrap();
        assert!(matches!(
            store.create_pending(pending("cs_1", 24)).await,
            Err(RegistrationError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn provisioning_flow_and_paid_listing() {
        let store = InMemoryRegistrationStore::new();
        store.create_pending(pending("cs_1", 24)).await.unwrap();
        store.create_pending(pending("cs_2", 24)).await.unwrap();
        store.mark_paid("cs_1", Utc::now()).await.unwrap();

        let paid = store.list_paid_unprovisioned(10).await.unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].checkout_session_id, "cs_1");

        assert!(!store.begin_provisioning("cs_2").await.unwrap());
        assert!(store.begin_provisioning("cs_1").await.unwrap());
        assert!(store.list_paid_unprovisioned(10).await.unwrap().is_empty());

        assert!(store.mark_failed("cs_1", "boom").await.unwrap());
        let row = store.get("cs_1").await.unwrap().unwrap();
        assert_eq!(row.status, RegistrationStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("boom"));

        store.finish("cs_1").await.unwrap();
        assert!(store.get("cs_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_expired_pending_rows() {
        let store = InMemoryRegistrationStore::new();
        store.create_pending(pending("old", -1)).await.unwrap();
        store.create_pending(pending("fresh", 24)).await.unwrap();
        store.create_pending(pending("old_paid", -1)).await.unwrap();
        store
            .compare_and_set("old_paid", RegistrationStatus::Pending, RegistrationStatus::Paid, None)
            .await
            .unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
        assert!(store.get("old_paid").await.unwrap().is_some());
    }
}
