//! API error taxonomy and HTTP response mapping.
//!
//! Errors raised before a stream opens map to status codes here. Once a
//! relay response has started, failures travel in-band as `error` events
//! instead (see [`crate::wire`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Request rejected before any I/O was attempted.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Bearer token missing or not resolvable to a user.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but not allowed to touch the resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Service-side configuration problem. Fails closed.
    #[error("Service configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Server-side details stay in the logs, not the response body.
        let message = match &self {
            Self::Config(_) => {
                tracing::error!(error = %self, "configuration error");
                "Service configuration error".to_string()
            }
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400() {
        let err = ApiError::validation("userMessageContent must not be empty");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("userMessageContent"));
    }

    #[test]
    fn config_and_internal_map_to_500() {
        assert_eq!(
            ApiError::Config("upstream API key".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let internal: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn forbidden_maps_to_403() {
        let err = ApiError::forbidden("chat belongs to another user");
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }
}
