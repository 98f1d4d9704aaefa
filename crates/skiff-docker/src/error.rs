//! Error types for the Docker API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use skiff_error::EngineError;
use thiserror::Error;

/// Result type alias for Docker API operations.
pub type Result<T> = std::result::Result<T, DockerError>;

/// Errors surfaced as Docker API responses.
///
/// Engine errors pass through with their message intact; the variant decides
/// the status code. `Detach` never reaches this layer because the backend
/// folds it into a successful attach return.
#[derive(Debug, Error)]
pub enum DockerError {
    /// An engine operation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Malformed request seen before the engine was involved.
    #[error("{0}")]
    BadParameter(String),

    /// The personality does not provide this operation.
    #[error("Skiff does not yet implement {0}")]
    NotImplemented(&'static str),

    /// Failure in the HTTP plumbing itself.
    #[error("Server error: {0}")]
    Server(String),
}

impl DockerError {
    #[must_use]
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Engine(e) => match e {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Conflict(_) => StatusCode::CONFLICT,
                EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
                EngineError::ResourceLocked(_) => StatusCode::LOCKED,
                EngineError::Internal(_) | EngineError::Detach | EngineError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::BadParameter(_) => StatusCode::BAD_REQUEST,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DockerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "message": self.to_string()
        });
        (status, axum::Json(body)).into_response()
    }
}
