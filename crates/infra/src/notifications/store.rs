use std::sync::{Arc, RwLock};

use chrono::Utc;

use coursegen_core::{NotificationId, TenantId, UserId};

use super::types::{NewNotification, Notification, NotificationError};

#[async_trait::async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, notification: NewNotification) -> Result<Notification, NotificationError>;

    /// Newest first.
    async fn list_for_user(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, NotificationError>;

    /// Only the owning user may mark a notification read; anyone else gets `NotFound`.
    async fn mark_read(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<Notification, NotificationError>;

    async fn unread_count(&self, tenant_id: TenantId, user_id: UserId) -> Result<usize, NotificationError>;
}

#[async_trait::async_trait]
impl<S> NotificationStore for Arc<S>
where
    S: NotificationStore + ?Sized,
{
    async fn create(&self, notification: NewNotification) -> Result<Notification, NotificationError> {
        (**self).create(notification).await
    }

    async fn list_for_user(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, NotificationError> {
        (**self).list_for_user(tenant_id, user_id, unread_only, limit).await
    }

    async fn mark_read(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<Notification, NotificationError> {
        (**self).mark_read(tenant_id, user_id, id).await
    }

    async fn unread_count(&self, tenant_id: TenantId, user_id: UserId) -> Result<usize, NotificationError> {
        (**self).unread_count(tenant_id, user_id).await
    }
}

/// In-memory notification store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    rows: RwLock<Vec<Notification>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored notification across tenants (test visibility).
    pub fn all(&self) -> Vec<Notification> {
        self.rows.read().map(|r| r.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> NotificationError {
    NotificationError::Storage("notification store lock poisoned".to_string())
}

#[async_trait::async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create(&self, notification: NewNotification) -> Result<Notification, NotificationError> {
        let row = notification.into_notification(Utc::now());
        self.rows.write().map_err(poisoned)?.push(row.clone());
        Ok(row)
    }

    async fn list_for_user(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, NotificationError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .iter()
            .rev()
            .filter(|n| n.tenant_id == tenant_id && n.user_id == user_id)
            .filter(|n| !unread_only || !n.read)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_read(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        id: NotificationId,
    ) -> Result<Notification, NotificationError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let row = rows
            .iter_mut()
            .find(|n| n.id == id && n.tenant_id == tenant_id && n.user_id == user_id)
            .ok_or(NotificationError::NotFound(id))?;

        if !row.read {
            row.read = true;
            row.read_at = Some(Utc::now());
        }
        Ok(row.clone())
    }

    async fn unread_count(&self, tenant_id: TenantId, user_id: UserId) -> Result<usize, NotificationError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .iter()
            .filter(|n| n.tenant_id == tenant_id && n.user_id == user_id && !n.read)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationKind;

    fn note(tenant: TenantId, user: UserId, title: &str) -> NewNotification {
        NewNotification::new(tenant, user, NotificationKind::JobCompleted, title, "body")
    }

    #[tokio::test]
    async fn list_is_newest_first_and_scoped_to_owner() {
        let store = InMemoryNotificationStore::new();
        let (tenant, user, other) = (TenantId::new(), UserId::new(), UserId::new());

        store.create(note(tenant, user, "first")).await.unwrap();
        store.create(note(tenant, user, "second")).await.unwrap();
        store.create(note(tenant, other, "not mine")).await.unwrap();
        store.create(note(TenantId::new(), user, "other tenant")).await.unwrap();

        let titles: Vec<String> = store
            .list_for_user(tenant, user, false, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.title)
            .collect();
        assert_eq!(titles, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn mark_read_is_owner_only_and_idempotent() {
        let store = InMemoryNotificationStore::new();
        let (tenant, user) = (TenantId::new(), UserId::new());
        let n = store.create(note(tenant, user, "x")).await.unwrap();

        assert!(matches!(
            store.mark_read(tenant, UserId::new(), n.id).await,
            Err(NotificationError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_read(TenantId::new(), user, n.id).await,
            Err(NotificationError::NotFound(_))
        ));

        let first = store.mark_read(tenant, user, n.id).await.unwrap();
        let again = store.mark_read(tenant, user, n.id).await.unwrap();
        assert!(first.read);
        assert_eq!(first.read_at, again.read_at);
        assert_eq!(store.unread_count(tenant, user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unread_only_filter() {
        let store = InMemoryNotificationStore::new();
        let (tenant, user) = (TenantId::new(), UserId::new());
        let read = store.create(note(tenant, user, "read")).await.unwrap();
        store.create(note(tenant, user, "unread")).await.unwrap();
        store.mark_read(tenant, user, read.id).await.unwrap();

        let unread = store.list_for_user(tenant, user, true, 10).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].title, "unread");
        assert_eq!(store.unread_count(tenant, user).await.unwrap(), 1);
    }
}
