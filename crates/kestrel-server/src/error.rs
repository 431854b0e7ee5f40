//! Error handling for the HTTP accessor
//!
//! Engine errors are mapped to status codes by their [`ErrorKind`], so a
//! kind wrapped in pipeline context still lands on the right status.

use crate::api::ValueBody;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kestrel_core::ErrorKind;
use serde::Serialize;
use std::fmt;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    /// Invalid request (400)
    BadRequest(String),

    /// Internal server error (500)
    Internal(String),

    /// Error from the engine or the historian
    Core(kestrel_core::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::Core(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Core(err) => match err.kind() {
                ErrorKind::InvalidFqn => (StatusCode::BAD_REQUEST, "INVALID_FQN"),
                ErrorKind::InvalidFeature => (StatusCode::BAD_REQUEST, "INVALID_FEATURE"),
                ErrorKind::TypeMismatch => (StatusCode::BAD_REQUEST, "TYPE_MISMATCH"),
                ErrorKind::UnsupportedPrimitive => (StatusCode::BAD_REQUEST, "UNSUPPORTED_PRIMITIVE"),
                ErrorKind::UnsupportedAggregator => (StatusCode::BAD_REQUEST, "UNSUPPORTED_AGGREGATOR"),
                ErrorKind::UnsupportedOperation => (StatusCode::BAD_REQUEST, "UNSUPPORTED_OPERATION"),
                ErrorKind::StaleWrite => (StatusCode::BAD_REQUEST, "STALE_WRITE"),
                ErrorKind::InvalidPipelineContext => (StatusCode::BAD_REQUEST, "INVALID_PIPELINE_CONTEXT"),
                ErrorKind::FeatureNotFound => (StatusCode::NOT_FOUND, "FEATURE_NOT_FOUND"),
                ErrorKind::FeatureAlreadyExists => (StatusCode::CONFLICT, "FEATURE_ALREADY_EXISTS"),
                ErrorKind::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "DEADLINE_EXCEEDED"),
                ErrorKind::StateUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "STATE_UNAVAILABLE"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

/// Error response sent to clients
///
/// ```json
/// {
///   "error": { "code": "FEATURE_NOT_FOUND", "message": "feature 'shop.clicks' not found" }
/// }
/// ```
///
/// A deadline error during a read also carries the value known so far.
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<ValueBody>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();

        if status.is_server_error() {
            tracing::error!(code, "Request error: {}", self);
        } else {
            tracing::debug!(code, "Request rejected: {}", self);
        }

        let value = match &self {
            AppError::Core(err) => err.partial_value().map(ValueBody::from),
            _ => None,
        };
        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
            },
            value,
        };

        (status, Json(body)).into_response()
    }
}

impl From<kestrel_core::Error> for AppError {
    fn from(err: kestrel_core::Error) -> Self {
        AppError::Core(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
