//! Infrastructure layer: job store, task queue, orchestration, workers,
//! notifications, cache, registration and config.

pub mod batch;
pub mod cache;
pub mod config;
pub mod event_bus;
pub mod jobs;
pub mod notifications;
pub mod orchestrator;
pub mod queue;
pub mod registration;
pub mod schema;
pub mod workers;

/// Shared Redis connection handling for the Redis-backed adapters.
#[cfg(feature = "redis")]
pub mod redis_conn;

#[cfg(test)]
mod integration_tests;
