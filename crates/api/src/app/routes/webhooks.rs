//! Public checkout endpoints. These sit outside the context middleware: the
//! webhook is authenticated by its signature, and signup happens before a
//! tenant exists.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;
use tracing::{info, warn};

use coursegen_infra::registration::NewRegistration;

use crate::app::errors;
use crate::app::services::AppServices;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn webhook_router() -> Router {
    Router::new().route("/checkout", post(checkout_webhook))
}

pub fn registration_router() -> Router {
    Router::new().route("/", post(create_registration))
}

/// Verify the payment provider's signature, then hand the event to the
/// trigger. Redelivered events resolve to a no-op outcome with 200 so the
/// provider stops retrying.
pub async fn checkout_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let event = match services.verifier.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejected checkout webhook");
            return errors::signature_error_to_response(e);
        }
    };

    match services.trigger.handle(&event).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::registration_error_to_response(e),
    }
}

/// Record signup details at checkout-session creation; they wait here for
/// the payment webhook.
pub async fn create_registration(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewRegistration>,
) -> axum::response::Response {
    if let Err(e) = body.validate() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string());
    }

    let ttl = match chrono::Duration::from_std(services.config.registration_ttl) {
        Ok(ttl) => ttl,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "config_error", e.to_string()),
    };
    let pending = body.into_pending(Utc::now(), ttl);

    match services.registrations.create_pending(pending.clone()).await {
        Ok(()) => {
            info!(checkout_session_id = %pending.checkout_session_id, "registration pending payment");
            (StatusCode::CREATED, Json(pending)).into_response()
        }
        Err(e) => errors::registration_error_to_response(e),
    }
}
