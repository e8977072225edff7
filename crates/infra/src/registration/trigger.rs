//! Webhook → provisioning bridge.
//!
//! A verified `checkout.session.completed` event flips its registration from
//! `pending` to `paid` with a compare-and-set; only the delivery that wins the
//! CAS enqueues a provisioning task. A failed enqueue leaves the row `paid`,
//! where the watchdog finds and re-enqueues it.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::store::RegistrationStore;
use super::types::{RegistrationError, RegistrationStatus};
use crate::queue::{EnqueueOptions, TaskId, TaskPayload, TaskQueue};

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// A webhook event whose signature has been checked.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent(WebhookEvent);

impl VerifiedEvent {
    pub(crate) fn new(event: WebhookEvent) -> Self {
        Self(event)
    }

    pub fn event(&self) -> &WebhookEvent {
        &self.0
    }

    pub fn event_type(&self) -> &str {
        &self.0.event_type
    }

    pub fn checkout_session_id(&self) -> Option<&str> {
        self.0.data.object.get("id")?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Not an event type this trigger reacts to.
    Ignored { event_type: String },
    /// No registration for the session (never created, or already provisioned).
    UnknownSession { checkout_session_id: String },
    /// Repeated delivery; the registration already left `pending`.
    Duplicate { status: RegistrationStatus },
    Expired,
    Enqueued { task_id: TaskId },
    /// CAS applied but the task could not be enqueued; the watchdog will retry.
    PaidPendingProvisioning,
}

#[derive(Clone)]
pub struct EventTrigger {
    registrations: Arc<dyn RegistrationStore>,
    queue: Arc<dyn TaskQueue>,
    enqueue: EnqueueOptions,
}

impl std::fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTrigger")
            .field("enqueue", &self.enqueue)
            .finish_non_exhaustive()
    }
}

impl EventTrigger {
    pub fn new(
        registrations: Arc<dyn RegistrationStore>,
        queue: Arc<dyn TaskQueue>,
        enqueue: EnqueueOptions,
    ) -> Self {
        Self {
            registrations,
            queue,
            enqueue,
        }
    }

    pub async fn handle(&self, event: &VerifiedEvent) -> Result<TriggerOutcome, RegistrationError> {
        if event.event_type() != CHECKOUT_COMPLETED {
            return Ok(TriggerOutcome::Ignored {
                event_type: event.event_type().to_string(),
            });
        }
        let session_id = event
            .checkout_session_id()
            .ok_or_else(|| RegistrationError::Validation("event has no checkout session id".into()))?;

        let Some(registration) = self.registrations.get(session_id).await? else {
            warn!(checkout_session_id = session_id, event_id = %event.event().id, "no registration for checkout session");
            return Ok(TriggerOutcome::UnknownSession {
                checkout_session_id: session_id.to_string(),
            });
        };

        if registration.status != RegistrationStatus::Pending {
            info!(checkout_session_id = session_id, status = registration.status.as_str(), "duplicate checkout event ignored");
            return Ok(TriggerOutcome::Duplicate {
                status: registration.status,
            });
        }
        let now = Utc::now();
        if registration.is_expired(now) {
            warn!(checkout_session_id = session_id, "checkout completed for an expired registration");
            return Ok(TriggerOutcome::Expired);
        }

        if !self.registrations.mark_paid(session_id, now).await? {
            // Lost the race to another delivery, or expiry caught up with us.
            return match self.registrations.get(session_id).await? {
                Some(r) if r.is_expired(now) => {
                    warn!(checkout_session_id = session_id, "registration expired before it was marked paid");
                    Ok(TriggerOutcome::Expired)
                }
                Some(r) => Ok(TriggerOutcome::Duplicate { status: r.status }),
                None => Ok(TriggerOutcome::Duplicate {
                    status: RegistrationStatus::Paid,
                }),
            };
        }
        info!(checkout_session_id = session_id, "registration marked paid");

        let payload = TaskPayload::Provisioning {
            checkout_session_id: session_id.to_string(),
        };
        match self.queue.enqueue(payload, self.enqueue.clone()).await {
            Ok(task) => Ok(TriggerOutcome::Enqueued { task_id: task.id }),
            Err(e) => {
                warn!(checkout_session_id = session_id, error = %e, "provisioning enqueue failed; left for the watchdog");
                Ok(TriggerOutcome::PaidPendingProvisioning)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::{
        DeadLetter, InMemoryTaskQueue, NackOutcome, QueueDepth, QueueError, Task, TaskKind,
    };
    use crate::registration::{InMemoryRegistrationStore, NewRegistration, PendingRegistration};

    fn event(event_type: &str, session: &str) -> VerifiedEvent {
        VerifiedEvent::new(WebhookEvent {
            id: "evt_1".into(),
            event_type: event_type.into(),
            data: WebhookEventData {
                object: serde_json::json!({ "id": session }),
            },
        })
    }

    async fn seeded(ttl_hours: i64) -> Arc<InMemoryRegistrationStore> {
        let store = Arc::new(InMemoryRegistrationStore::new());
        let pending = NewRegistration {
            checkout_session_id: "cs_1".into(),
            email: "owner@example.com".into(),
            company_name: "Acme".into(),
            plan: "team".into(),
        }
        .into_pending(Utc::now(), chrono::Duration::hours(ttl_hours));
        store.create_pending(pending).await.unwrap();
        store
    }

    struct DownQueue;

    #[async_trait::async_trait]
    impl TaskQueue for DownQueue {
        async fn enqueue(&self, _: TaskPayload, _: EnqueueOptions) -> Result<Task, QueueError> {
            Err(QueueError::Backend("down".into()))
        }
        async fn dequeue(&self, _: &[TaskKind], _: Duration) -> Result<Option<Task>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: TaskId) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(&self, id: TaskId, _: &str, _: Duration) -> Result<NackOutcome, QueueError> {
            Err(QueueError::NotFound(id))
        }
        async fn dead_letters(&self, _: usize) -> Result<Vec<DeadLetter>, QueueError> {
            Ok(Vec::new())
        }
        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            Ok(QueueDepth::default())
        }
    }

    /// Serves one stale read that still looks unexpired, like a row read just
    /// before its deadline passed.
    struct StaleFirstRead {
        inner: InMemoryRegistrationStore,
        served: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl RegistrationStore for StaleFirstRead {
        async fn create_pending(&self, registration: PendingRegistration) -> Result<(), RegistrationError> {
            self.inner.create_pending(registration).await
        }
        async fn get(&self, id: &str) -> Result<Option<PendingRegistration>, RegistrationError> {
            let row = self.inner.get(id).await?;
            if self.served.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(row);
            }
            Ok(row.map(|mut r| {
                r.expires_at = Utc::now() + chrono::Duration::hours(1);
                r
            }))
        }
        async fn compare_and_set(
            &self,
            id: &str,
            expected: RegistrationStatus,
            next: RegistrationStatus,
            error: Option<&str>,
        ) -> Result<bool, RegistrationError> {
            self.inner.compare_and_set(id, expected, next, error).await
        }
        async fn mark_paid(&self, id: &str, now: chrono::DateTime<Utc>) -> Result<bool, RegistrationError> {
            self.inner.mark_paid(id, now).await
        }
        async fn finish(&self, id: &str) -> Result<(), RegistrationError> {
            self.inner.finish(id).await
        }
        async fn list_paid_unprovisioned(&self, limit: usize) -> Result<Vec<PendingRegistration>, RegistrationError> {
            self.inner.list_paid_unprovisioned(limit).await
        }
        async fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<usize, RegistrationError> {
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn expiry_between_read_and_write_is_not_marked_paid() {
        let inner = InMemoryRegistrationStore::new();
        let pending = NewRegistration {
            checkout_session_id: "cs_1".into(),
            email: "owner@example.com".into(),
            company_name: "Acme".into(),
            plan: "team".into(),
        }
        .into_pending(Utc::now(), chrono::Duration::seconds(-1));
        inner.create_pending(pending).await.unwrap();
        let store = Arc::new(StaleFirstRead {
            inner,
            served: std::sync::atomic::AtomicBool::new(false),
        });
        let queue = Arc::new(InMemoryTaskQueue::new());
        let trigger = EventTrigger::new(store.clone(), queue.clone(), EnqueueOptions::default());

        let outcome = trigger.handle(&event(CHECKOUT_COMPLETED, "cs_1")).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Expired);
        assert_eq!(
            store.get("cs_1").await.unwrap().unwrap().status,
            RegistrationStatus::Pending
        );
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn duplicate_delivery_enqueues_once() {
        let store = seeded(24).await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let trigger = EventTrigger::new(store.clone(), queue.clone(), EnqueueOptions::default());
        let evt = event(CHECKOUT_COMPLETED, "cs_1");

        let first = trigger.handle(&evt).await.unwrap();
        let second = trigger.handle(&evt).await.unwrap();

        assert!(matches!(first, TriggerOutcome::Enqueued { .. }));
        assert_eq!(
            second,
            TriggerOutcome::Duplicate {
                status: RegistrationStatus::Paid
            }
        );
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_enqueue_once() {
        let store = seeded(24).await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let trigger = EventTrigger::new(store, queue.clone(), EnqueueOptions::default());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let trigger = trigger.clone();
            handles.push(tokio::spawn(async move {
                trigger.handle(&event(CHECKOUT_COMPLETED, "cs_1")).await.unwrap()
            }));
        }
        let mut enqueued = 0;
        for h in handles {
            if matches!(h.await.unwrap(), TriggerOutcome::Enqueued { .. }) {
                enqueued += 1;
            }
        }

        assert_eq!(enqueued, 1);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn other_event_types_are_ignored() {
        let store = seeded(24).await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let trigger = EventTrigger::new(store.clone(), queue, EnqueueOptions::default());

        let outcome = trigger.handle(&event("invoice.paid", "cs_1")).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Ignored { .. }));
        assert_eq!(
            store.get("cs_1").await.unwrap().unwrap().status,
            RegistrationStatus::Pending
        );
    }

    #[tokio::test]
    async fn enqueue_failure_keeps_the_paid_transition() {
        let store = seeded(24).await;
        let trigger = EventTrigger::new(store.clone(), Arc::new(DownQueue), EnqueueOptions::default());

        let outcome = trigger.handle(&event(CHECKOUT_COMPLETED, "cs_1")).await.unwrap();

        assert_eq!(outcome, TriggerOutcome::PaidPendingProvisioning);
        assert_eq!(store.list_paid_unprovisioned(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_and_unknown_sessions_do_nothing() {
        let store = seeded(-1).await;
        let queue = Arc::new(InMemoryTaskQueue::new());
        let trigger = EventTrigger::new(store, queue.clone(), EnqueueOptions::default());

        assert_eq!(
            trigger.handle(&event(CHECKOUT_COMPLETED, "cs_1")).await.unwrap(),
            TriggerOutcome::Expired
        );
        assert!(matches!(
            trigger.handle(&event(CHECKOUT_COMPLETED, "cs_404")).await.unwrap(),
            TriggerOutcome::UnknownSession { .. }
        ));
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }
}
