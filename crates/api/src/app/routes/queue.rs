//! Executor-facing queue protocol.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::debug;

use crate::app::{dto, errors, extract::JsonBody, services::AppServices};

/// POST /.executors/queue/:queue/dequeue
pub async fn dequeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::DequeueRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler.dequeue(body.into_params()).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /.executors/queue/:queue/heartbeat
pub async fn heartbeat(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::HeartbeatRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    if !body.prometheus_metrics.is_empty() {
        debug!(
            queue = %queue,
            executor = %body.executor_name,
            bytes = body.prometheus_metrics.len(),
            "ignoring executor metrics"
        );
    }

    match handler
        .heartbeat(body.executor(&queue), body.version.as_deref(), &body.job_ids)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(dto::HeartbeatResponse::from(outcome))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /.executors/queue/:queue/addExecutionLogEntry
pub async fn add_execution_log_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::AddExecutionLogEntryRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler
        .add_execution_log_entry(&body.executor_name, body.job_id, &body.entry)
        .await
    {
        Ok(entry_id) => (StatusCode::OK, Json(entry_id)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /.executors/queue/:queue/updateExecutionLogEntry
pub async fn update_execution_log_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::UpdateExecutionLogEntryRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler
        .update_execution_log_entry(&body.executor_name, body.job_id, body.entry_id, &body.entry)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /.executors/queue/:queue/markComplete
pub async fn mark_complete(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::MarkCompleteRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler.mark_complete(&body.executor_name, body.job_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /.executors/queue/:queue/markErrored
pub async fn mark_errored(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::MarkErroredRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler
        .mark_errored(&body.executor_name, body.job_id, &body.error_message)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /.executors/queue/:queue/markFailed
pub async fn mark_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    JsonBody(body): JsonBody<dto::MarkErroredRequest>,
) -> axum::response::Response {
    let handler = match services.queue(&queue) {
        Ok(h) => h,
        Err(resp) => return resp,
    };

    match handler
        .mark_failed(&body.executor_name, body.job_id, &body.error_message)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
