//! Redis pub/sub-backed event bus (optional).
//!
//! Each envelope is published on its own tenant+user channel
//! (`tenant:{t}:user:{u}:notifications`). A subscription listens on the
//! pattern covering every such channel; consumers filter by tenant and user.
//!
//! Redis pub/sub is not durable: messages are dropped while no subscriber is
//! connected. That is acceptable here because the notification store is the
//! record of truth.

use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use coursegen_events::{EventBus, EventEnvelope, Subscription};

const CHANNEL_PATTERN: &str = "tenant:*:user:*:notifications";

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for JSON event envelopes.
#[derive(Debug)]
pub struct RedisPubSubEventBus<E> {
    client: redis::Client,
    _payload: PhantomData<fn() -> E>,
}

impl<E> Clone for RedisPubSubEventBus<E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _payload: PhantomData,
        }
    }
}

impl<E> RedisPubSubEventBus<E> {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            _payload: PhantomData,
        })
    }
}

impl<E> EventBus<EventEnvelope<E>> for RedisPubSubEventBus<E>
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisBusError;

    fn publish(&self, message: EventEnvelope<E>) -> Result<(), Self::Error> {
        let channel = message.channel().name();
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(&channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        debug!(channel, receivers, "published to redis");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<E>> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.psubscribe(CHANNEL_PATTERN) {
                warn!(error = %e, "redis psubscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope: EventEnvelope<E> = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "dropping undecodable pub/sub message");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
