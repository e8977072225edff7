//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: adapter selection, orchestration wiring, background workers
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and query parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    // Protected routes: require a request context.
    let protected = routes::router()
        .layer(axum::middleware::from_fn(middleware::context_middleware))
        .layer(Extension(services.clone()));

    Router::new()
        .merge(routes::public_router())
        .layer(Extension(services))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
