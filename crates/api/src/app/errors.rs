use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use execq_core::ProtocolError;
use execq_infra::RegistryError;
use execq_infra::queue::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::InvalidExecutorName => {
            json_error(StatusCode::BAD_REQUEST, "invalid_executor_name", err.to_string())
        }
        QueueError::UnknownJob(_) => json_error(StatusCode::NOT_FOUND, "unknown_job", err.to_string()),
        QueueError::Protocol(ProtocolError::InvalidExecutorVersion { .. }) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_version", err.to_string())
        }
        QueueError::Protocol(ProtocolError::InvalidId(_)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", err.to_string())
        }
        QueueError::Protocol(_) => {
            error!(error = %err, "protocol error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "protocol_error", err.to_string())
        }
        QueueError::Transform { .. } => {
            error!(error = %err, "transform failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "transform_failed", err.to_string())
        }
        QueueError::Store(ref e) if e.is_unavailable() => {
            error!(error = %err, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
        }
        QueueError::Store(_) => {
            error!(error = %err, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

pub fn registry_error_to_response(err: RegistryError) -> axum::response::Response {
    error!(error = %err, "executor registry error");
    match err {
        RegistryError::Unavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
        }
        RegistryError::Storage(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    }
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

pub fn parse_record_id(raw: &str) -> Result<execq_core::RecordId, axum::response::Response> {
    raw.parse()
        .map_err(|e: ProtocolError| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
