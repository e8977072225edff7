use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    response::{IntoResponse, sse::Event as SseEvent},
    routing::{get, post},
};
use serde_json::json;

use coursegen_core::NotificationId;

use crate::app::services::{self, AppServices};
use crate::app::{dto, errors};
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_notifications))
        .route("/stream", get(stream))
        .route("/:id/read", post(mark_read))
}

pub async fn list_notifications(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<dto::ListNotificationsQuery>,
) -> axum::response::Response {
    let notifications = match services
        .notifications
        .list_for_user(ctx.tenant_id(), ctx.user_id(), query.unread_only, query.limit())
        .await
    {
        Ok(n) => n,
        Err(e) => return errors::notification_error_to_response(e),
    };

    match services.notifications.unread_count(ctx.tenant_id(), ctx.user_id()).await {
        Ok(unread) => Json(json!({
            "notifications": notifications,
            "unreadCount": unread,
        }))
        .into_response(),
        Err(e) => errors::notification_error_to_response(e),
    }
}

pub async fn mark_read(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: NotificationId = match errors::parse_id(&id, "notification") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .notifications
        .mark_read(ctx.tenant_id(), ctx.user_id(), id)
        .await
    {
        Ok(notification) => Json(notification).into_response(),
        Err(e) => errors::notification_error_to_response(e),
    }
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::notification_sse_stream(services, ctx)
}
