//! API error type and the JSON error envelope.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use hotspot_core::{CoreError, ErrorKind};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, warn};

use super::context::current_request_id;

/// Body of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    /// Canonical reason phrase of `status_code`.
    pub error: String,
    pub message: String,
    /// Machine-readable code: the error kind, or the forbidden status token.
    pub code: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> String {
        match self {
            Self::BadRequest(_) => "bad_request".into(),
            Self::Core(CoreError::Forbidden { status, .. }) => status.to_string(),
            Self::Core(e) => e.kind().to_string(),
            Self::Internal(_) => "internal".into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        let Self::Core(e) = self else {
            return match self {
                Self::BadRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
        };
        match e.kind() {
            ErrorKind::Validation => match e {
                CoreError::Validation { field: Some(_), .. } => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::BAD_REQUEST,
            },
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::Integrity => StatusCode::CONFLICT,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::External => match e {
                CoreError::Gateway {
                    connection: true, ..
                }
                | CoreError::LockStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Core(CoreError::Validation {
                field: Some(field), ..
            }) => Some(json!({ "field": field })),
            Self::Core(CoreError::Forbidden { status, .. }) => Some(json!({ "status": status })),
            Self::Core(CoreError::RateLimited { retry_after_secs }) => {
                Some(json!({ "retry_after_secs": retry_after_secs }))
            }
            _ => None,
        }
    }

    /// Client-facing message. Server-side failures are not described.
    fn public_message(&self, status: StatusCode) -> String {
        match self {
            Self::Core(
                CoreError::Validation { message, .. } | CoreError::Forbidden { message, .. },
            ) => message.clone(),
            _ if status.is_server_error() => "the request could not be completed".into(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = ErrorEnvelope {
            success: false,
            error: status.canonical_reason().unwrap_or("Error").to_owned(),
            message: self.public_message(status),
            code: self.code(),
            status_code: status.as_u16(),
            request_id: current_request_id(),
            details: self.details(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Self::Core(CoreError::RateLimited { retry_after_secs }) = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
