//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orchestrator::WorkflowError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Workflow(err) => workflow_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn workflow_error_to_response(err: WorkflowError) -> (StatusCode, String) {
    match &err {
        WorkflowError::WorkflowNotFound(_)
        | WorkflowError::TransactionNotFound { .. }
        | WorkflowError::UnknownStep { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        WorkflowError::InvalidState { .. } | WorkflowError::RegistrySealed(_) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        WorkflowError::StepInvoke { .. }
        | WorkflowError::StepCompensate { .. }
        | WorkflowError::RetryExhausted { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "internal server error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
