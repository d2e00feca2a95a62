// crates/server/src/error.rs
//! HTTP error type for route handlers.
//!
//! Internal operations return explicit success/failure; this type maps
//! failures to status codes and a JSON `{"error": ...}` body so a failed
//! action is always visible to the caller, never a silent no-op.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use crate::bridge::BridgeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Rejected(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Rejected(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Bridge(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::NotFound("session".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Rejected("not active".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_not_found_message() {
        let err = ApiError::NotFound("session 'abc'".into());
        assert_eq!(err.to_string(), "session 'abc' not found");
    }
}
