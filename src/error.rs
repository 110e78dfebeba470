use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::queue::QueueError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Unavailable(&'static str, String),
    Internal(&'static str, String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn db(e: sqlx::Error) -> Self {
        ApiError::Internal("INTERNAL", format!("db error: {e}"))
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Validation { .. } => ApiError::BadRequest("VALIDATION_ERROR", e.to_string()),
            QueueError::NotFound(_) => ApiError::NotFound("NOT_FOUND", e.to_string()),
            QueueError::Conflict(_) => ApiError::Conflict("QUEUE_CONFLICT", format!("{e}; please retry")),
            QueueError::DataIntegrity(_) => {
                tracing::error!(error = %e, "queue data integrity violation");
                ApiError::Internal("DATA_INTEGRITY", e.to_string())
            }
            QueueError::Transaction(ref source) => {
                tracing::error!(error = %source, "queue transaction failed");
                ApiError::Unavailable("TRANSACTION_FAILED", "The operation could not be completed; no changes were saved".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Unavailable(code, msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Internal(code, msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::to_error_response(code, &msg),
            )
                .into_response(),
        }
    }
}
