// Error taxonomy shared across the engine.
//
// Every handler boundary converts one of these into a structured JSON error
// response; none of them crash the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Required credential or configuration is absent. Fails fast, no retry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or malformed field in the request. Rejected, surfaced to caller.
    #[error("{0}")]
    ClientInput(String),

    /// Referenced record does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Unsupported verb for a matched route.
    #[error("method {method} not allowed for '{route}'")]
    MethodNotAllowed { method: String, route: String },

    /// Network or provider failure. Surfaced with detail, not retried here.
    #[error("upstream provider error: {0}")]
    UpstreamProvider(String),

    /// Backing store unreadable or unwritable. Never masked as empty data.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A generation is already in flight for the session.
    #[error("a generation is already in flight for this session")]
    SessionBusy,
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::ClientInput(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            EngineError::UpstreamProvider(_) => StatusCode::BAD_GATEWAY,
            EngineError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::SessionBusy => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::ClientInput("email is required".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::NotFound("goal".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::SessionBusy.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::StorageUnavailable("disk".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_method_not_allowed_message() {
        let err = EngineError::MethodNotAllowed {
            method: "DELETE".into(),
            route: "profile".into(),
        };
        assert_eq!(err.to_string(), "method DELETE not allowed for 'profile'");
    }
}
