use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use coursegen_infra::batch::BatchError;
use coursegen_infra::jobs::JobStoreError;
use coursegen_infra::notifications::NotificationError;
use coursegen_infra::orchestrator::ContentError;
use coursegen_infra::registration::{RegistrationError, SignatureError};

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        JobStoreError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ JobStoreError::InvalidState { .. } => json_error(StatusCode::CONFLICT, "invalid_state", e.to_string()),
        e @ (JobStoreError::ConcurrencyConflict(_) | JobStoreError::NotReady { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        JobStoreError::Hierarchy(msg) => json_error(StatusCode::CONFLICT, "hierarchy_violation", msg),
        JobStoreError::Storage(msg) => store_failure("job store", msg),
    }
}

pub fn batch_error_to_response(err: BatchError) -> axum::response::Response {
    match err {
        BatchError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        BatchError::Store(e) => job_store_error_to_response(e),
        BatchError::Queue(e) => store_failure("task queue", e.to_string()),
    }
}

pub fn content_error_to_response(err: ContentError) -> axum::response::Response {
    match err {
        ContentError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
        ContentError::Storage(msg) => store_failure("content repository", msg),
    }
}

pub fn notification_error_to_response(err: NotificationError) -> axum::response::Response {
    match err {
        NotificationError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "notification not found"),
        NotificationError::Storage(msg) => store_failure("notification store", msg),
    }
}

pub fn registration_error_to_response(err: RegistrationError) -> axum::response::Response {
    match err {
        RegistrationError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("registration {id} not found"))
        }
        RegistrationError::Duplicate(id) => {
            json_error(StatusCode::CONFLICT, "duplicate", format!("registration {id} already exists"))
        }
        RegistrationError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        RegistrationError::Storage(msg) => store_failure("registration store", msg),
    }
}

pub fn signature_error_to_response(err: SignatureError) -> axum::response::Response {
    match err {
        SignatureError::InvalidPayload(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
        other => json_error(StatusCode::BAD_REQUEST, "invalid_signature", other.to_string()),
    }
}

fn store_failure(component: &'static str, message: String) -> axum::response::Response {
    tracing::error!(component, error = %message, "request failed on storage");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_id<T: std::str::FromStr>(raw: &str, what: &'static str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}
