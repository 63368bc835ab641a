//! Operator routes: enqueue, inspect and cancel records; list executors.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use execq_infra::queues::IndexingRecord;

use crate::app::{dto, errors, extract::JsonBody, services::AppServices};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/executors", get(list_executors))
        .route("/queue/:queue/jobs", post(enqueue))
        .route("/queue/:queue/jobs/:id", get(get_job))
        .route("/queue/:queue/jobs/:id/cancel", post(cancel_job))
        .route("/queue/:queue/stats", get(queue_stats))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /admin/queue/:queue/jobs - Enqueue a record
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<IndexingRecord>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler.enqueue(body).await {
        Ok(id) => (StatusCode::CREATED, Json(dto::EnqueueResponse { id })).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /admin/queue/:queue/jobs/:id - Read a record
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let id = match errors::parse_record_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match handler.get(id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "unknown_job", format!("unknown job {id}")),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /admin/queue/:queue/jobs/:id/cancel - Request cancellation
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let id = match errors::parse_record_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match handler.cancel(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /admin/queue/:queue/stats - Record counts per state
pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /admin/executors - Executors seen via heartbeat
pub async fn list_executors(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.registry().list().await {
        Ok(executors) => (StatusCode::OK, Json(executors)).into_response(),
        Err(e) => errors::registry_error_to_response(e),
    }
}
