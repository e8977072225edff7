//! User notifications: durable store plus real-time fan-out.
//!
//! The store is the record of truth. Publishing on the tenant+user channel
//! is an optimization; a client that missed a push re-reads the store.

pub mod fanout;
pub mod postgres;
pub mod store;
pub mod types;

pub use fanout::{NotificationBus, NotificationEnvelope, NotificationFanout};
pub use postgres::PostgresNotificationStore;
pub use store::{InMemoryNotificationStore, NotificationStore};
pub use types::{
    Milestone, NewNotification, Notification, NotificationError, NotificationKind,
    NotificationPriority,
};
