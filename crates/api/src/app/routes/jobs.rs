use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
};

use coursegen_infra::jobs::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
        .route("/:id/children", get(list_children))
        .route("/:id/cancel", post(cancel_job))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.to_filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match services.jobs.list(ctx.tenant_id(), &filter, query.limit()).await {
        Ok(jobs) => Json(dto::JobListResponse { jobs }).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Response {
    match services.jobs.stats(ctx.tenant_id()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.get(ctx.tenant_id(), id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::job_store_error_to_response(coursegen_infra::jobs::JobStoreError::NotFound(id)),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn list_children(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.children(ctx.tenant_id(), id).await {
        Ok(jobs) => Json(dto::JobListResponse { jobs }).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// Cooperative: a running job stops at its next checkpoint. Cancelling a
/// terminal job returns it unchanged.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match errors::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.cancel(ctx, id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}
