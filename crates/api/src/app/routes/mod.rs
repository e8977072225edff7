use axum::Router;

pub mod generation;
pub mod jobs;
pub mod notifications;
pub mod system;
pub mod webhooks;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .merge(generation::router())
        .nest("/jobs", jobs::router())
        .nest("/notifications", notifications::router())
        .nest("/admin", system::admin_router())
}

/// Endpoints reachable without a request context.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", axum::routing::get(system::health))
        .nest("/webhooks", webhooks::webhook_router())
        .nest("/registrations", webhooks::registration_router())
}
