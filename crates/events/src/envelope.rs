use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coursegen_core::{TenantId, UserId};

/// Addressing for real-time delivery: one channel per tenant + user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}

impl Channel {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }

    /// Transport-level channel name (e.g. the Redis pub/sub channel).
    pub fn name(&self) -> String {
        format!("tenant:{}:user:{}:notifications", self.tenant_id, self.user_id)
    }
}

/// Envelope for a real-time event.
///
/// - **Multi-tenancy** is carried by the channel; consumers filter on it.
/// - `topic` is a dotted event name (e.g. `job.completed`).
/// - `payload` is transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    channel: Channel,
    topic: String,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(channel: Channel, topic: impl Into<String>, payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            channel,
            topic: topic.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn tenant_id(&self) -> TenantId {
        self.channel.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.channel.user_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
