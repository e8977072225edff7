use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub fn admin_router() -> Router {
    Router::new().route("/queue", get(queue_overview))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// Queue depth plus the most recent dead letters.
pub async fn queue_overview(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<DeadLetterQuery>,
) -> axum::response::Response {
    let depth = match services.queue.depth().await {
        Ok(depth) => depth,
        Err(e) => {
            tracing::error!(error = %e, "queue depth unavailable");
            return errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string());
        }
    };

    match services.queue.dead_letters(dto::clamp_limit(query.limit)).await {
        Ok(dead_letters) => Json(json!({
            "depth": depth,
            "deadLetters": dead_letters,
        }))
        .into_response(),
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string()),
    }
}
