//! API error types.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Seconds suggested to clients while quota recovery is in progress.
const RETRY_AFTER_SECS: u32 = 30;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or unusable request body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Quota is exhausted and a rotation is in progress or pending.
    #[error("quota exhausted; credential rotation in progress")]
    QuotaExhausted,

    /// The profile pool is depleted and the pipeline is emergency-locked.
    #[error("no usable credential profiles remain")]
    RotationExhausted,

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// The client disconnected before a result was produced.
    #[error("client disconnected")]
    Disconnected,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body, OpenAI-style.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::QuotaExhausted => (StatusCode::SERVICE_UNAVAILABLE, "quota_exhausted"),
            ApiError::RotationExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, "rotation_exhausted")
            }
            ApiError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            ApiError::Disconnected => (StatusCode::BAD_REQUEST, "client_disconnected"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                code: code.to_string(),
            },
        };

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, ApiError::QuotaExhausted) {
            if let Ok(value) = RETRY_AFTER_SECS.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
