use axum::{routing::post, Router};

pub mod admin;
pub mod queue;
pub mod system;

/// Router for executor-facing endpoints (mounted under `/.executors/queue`).
pub fn executor_router() -> Router {
    Router::new()
        .route("/:queue/dequeue", post(queue::dequeue))
        .route("/:queue/heartbeat", post(queue::heartbeat))
        .route("/:queue/addExecutionLogEntry", post(queue::add_execution_log_entry))
        .route("/:queue/updateExecutionLogEntry", post(queue::update_execution_log_entry))
        .route("/:queue/markComplete", post(queue::mark_complete))
        .route("/:queue/markErrored", post(queue::mark_errored))
        .route("/:queue/markFailed", post(queue::mark_failed))
}

/// Router for operator endpoints (mounted under `/admin`).
pub fn admin_router() -> Router {
    admin::router()
}
