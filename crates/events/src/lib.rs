//! Real-time event distribution mechanics.
//!
//! The bus is the best-effort push side of notifications; durable state
//! lives in the notification store, never here.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{Channel, EventEnvelope};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
