//! Durable notification write followed by a best-effort real-time publish.

use std::sync::Arc;

use tracing::{debug, warn};

use coursegen_events::{Channel, EventEnvelope, Subscription};

use super::store::NotificationStore;
use super::types::{Milestone, NewNotification, Notification, NotificationError};
use crate::jobs::GenerationJob;

pub type NotificationEnvelope = EventEnvelope<Notification>;

/// Object-safe view of a [`coursegen_events::EventBus`] carrying notifications.
pub trait NotificationBus: Send + Sync {
    fn publish(&self, envelope: NotificationEnvelope) -> Result<(), String>;

    fn subscribe(&self) -> Subscription<NotificationEnvelope>;
}

impl<B> NotificationBus for B
where
    B: coursegen_events::EventBus<NotificationEnvelope>,
{
    fn publish(&self, envelope: NotificationEnvelope) -> Result<(), String> {
        coursegen_events::EventBus::publish(self, envelope).map_err(|e| format!("{e:?}"))
    }

    fn subscribe(&self) -> Subscription<NotificationEnvelope> {
        coursegen_events::EventBus::subscribe(self)
    }
}

#[derive(Clone)]
pub struct NotificationFanout {
    store: Arc<dyn NotificationStore>,
    bus: Arc<dyn NotificationBus>,
}

impl std::fmt::Debug for NotificationFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationFanout").finish_non_exhaustive()
    }
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn NotificationStore>, bus: Arc<dyn NotificationBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn NotificationBus> {
        &self.bus
    }

    /// Persist, then push. Only the persist step can fail the call.
    pub async fn notify(&self, notification: NewNotification) -> Result<Notification, NotificationError> {
        let stored = self.store.create(notification).await?;

        let envelope = EventEnvelope::new(
            Channel::new(stored.tenant_id, stored.user_id),
            stored.kind.topic(),
            stored.clone(),
        );
        let bus = self.bus.clone();
        let notification_id = stored.id;

        // Transports may block (sync Redis client); keep them off the async workers.
        match tokio::task::spawn_blocking(move || bus.publish(envelope)).await {
            Ok(Ok(())) => debug!(%notification_id, "notification published"),
            Ok(Err(e)) => warn!(%notification_id, error = %e, "notification publish failed"),
            Err(e) => warn!(%notification_id, error = %e, "notification publish task panicked"),
        }

        Ok(stored)
    }

    /// Milestone notification for the job's creator. Failures are logged and
    /// swallowed so a notification problem never changes a job's outcome.
    pub async fn job_milestone(&self, job: &GenerationJob, milestone: Milestone) {
        if let Err(e) = self.notify(NewNotification::for_job(job, milestone)).await {
            warn!(job_id = %job.id, tenant_id = %job.tenant_id, ?milestone, error = %e, "failed to record job notification");
        }
    }
}
