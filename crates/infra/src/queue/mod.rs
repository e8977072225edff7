//! Durable task queue: the transport between request handlers and workers.
//!
//! Delivery is at-least-once. A dequeued task is invisible to other
//! consumers until it is acked, nacked, or its visibility timeout lapses.
//! Exhausting `max_deliveries` routes the task to the dead-letter list.

use std::sync::Arc;
use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;

pub use in_memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use redis::RedisTaskQueue;
pub use types::{
    DEFAULT_MAX_DELIVERIES, DeadLetter, EnqueueOptions, NackOutcome, QueueDepth, QueueError, Task,
    TaskId, TaskKind, TaskPayload,
};

#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, payload: TaskPayload, opts: EnqueueOptions) -> Result<Task, QueueError>;

    /// Next available task of one of `kinds`, or `None` if nothing is ready.
    async fn dequeue(&self, kinds: &[TaskKind], visibility_timeout: Duration) -> Result<Option<Task>, QueueError>;

    /// Remove permanently. Acking an unknown task is a no-op.
    async fn ack(&self, id: TaskId) -> Result<(), QueueError>;

    /// Return for redelivery after `delay`, or dead-letter when the budget is spent.
    async fn nack(&self, id: TaskId, reason: &str, delay: Duration) -> Result<NackOutcome, QueueError>;

    /// Oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

#[async_trait::async_trait]
impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    async fn enqueue(&self, payload: TaskPayload, opts: EnqueueOptions) -> Result<Task, QueueError> {
        (**self).enqueue(payload, opts).await
    }

    async fn dequeue(&self, kinds: &[TaskKind], visibility_timeout: Duration) -> Result<Option<Task>, QueueError> {
        (**self).dequeue(kinds, visibility_timeout).await
    }

    async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
        (**self).ack(id).await
    }

    async fn nack(&self, id: TaskId, reason: &str, delay: Duration) -> Result<NackOutcome, QueueError> {
        (**self).nack(id, reason, delay).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        (**self).dead_letters(limit).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        (**self).depth().await
    }
}
