use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use coursegen_core::{CourseId, LessonId, SmeTaskId, SubmissionId};
use coursegen_infra::jobs::JobPayload;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route(
            "/sme/tasks/:sme_task_id/submissions/:submission_id/ingest",
            post(ingest_submission),
        )
        .route("/courses/:course_id/outline", post(create_outline))
        .route("/courses/:course_id/outline/approve", post(approve_outline))
        .route("/courses/:course_id/lessons/:lesson_id/content", post(generate_lesson))
        .route(
            "/courses/:course_id/lessons/:lesson_id/components/:component/regenerate",
            post(regenerate_component),
        )
        .route("/courses/:course_id/generate", post(generate_course))
}

async fn submit(services: &AppServices, ctx: RequestContext, payload: JobPayload) -> axum::response::Response {
    match services.submit(ctx, payload).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn ingest_submission(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((sme_task_id, submission_id)): Path<(String, String)>,
) -> axum::response::Response {
    let sme_task_id: SmeTaskId = match errors::parse_id(&sme_task_id, "sme task") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let submission_id: SubmissionId = match errors::parse_id(&submission_id, "submission") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    submit(
        &services,
        ctx,
        JobPayload::SmeIngestion {
            sme_task_id,
            submission_id,
        },
    )
    .await
}

pub async fn create_outline(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(course_id): Path<String>,
    Json(body): Json<dto::CreateOutlineRequest>,
) -> axum::response::Response {
    let course_id: CourseId = match errors::parse_id(&course_id, "course") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    submit(
        &services,
        ctx,
        JobPayload::CourseOutline {
            course_id,
            brief: body.brief,
        },
    )
    .await
}

pub async fn generate_lesson(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((course_id, lesson_id)): Path<(String, String)>,
) -> axum::response::Response {
    let course_id: CourseId = match errors::parse_id(&course_id, "course") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let lesson_id: LessonId = match errors::parse_id(&lesson_id, "lesson") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    submit(&services, ctx, JobPayload::LessonContent { course_id, lesson_id }).await
}

pub async fn regenerate_component(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path((course_id, lesson_id, component)): Path<(String, String, String)>,
    body: Option<Json<dto::RegenerateComponentRequest>>,
) -> axum::response::Response {
    let course_id: CourseId = match errors::parse_id(&course_id, "course") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let lesson_id: LessonId = match errors::parse_id(&lesson_id, "lesson") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let instructions = body.and_then(|Json(b)| b.instructions);

    submit(
        &services,
        ctx,
        JobPayload::ComponentRegen {
            course_id,
            lesson_id,
            component,
            instructions,
        },
    )
    .await
}

/// FULL_COURSE: the worker fans the saved outline out into lesson jobs.
pub async fn generate_course(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(course_id): Path<String>,
) -> axum::response::Response {
    let course_id: CourseId = match errors::parse_id(&course_id, "course") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    submit(&services, ctx, JobPayload::FullCourse { course_id }).await
}

/// Outline approval: one lesson job per outline lesson under a new parent.
pub async fn approve_outline(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(course_id): Path<String>,
) -> axum::response::Response {
    let course_id: CourseId = match errors::parse_id(&course_id, "course") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let outline = match services.content.outline(ctx.tenant_id(), course_id).await {
        Ok(Some(outline)) => outline,
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "course outline not found"),
        Err(e) => return errors::content_error_to_response(e),
    };

    match services
        .approve_outline(ctx, course_id, outline.lesson_ids())
        .await
    {
        Ok(started) => (
            StatusCode::ACCEPTED,
            Json(dto::BatchResponse {
                parent: started.parent,
                children: started.children,
            }),
        )
            .into_response(),
        Err(e) => errors::batch_error_to_response(e),
    }
}
