//! The engine-level error taxonomy.

use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Lifecycle code never looks at transport errors directly; the port-layer
/// proxy folds every wire failure into one of these variants. `Detach` is a
/// pseudo-error used by the attach path to signal that the client sent the
/// detach sequence; it must never reach an HTTP response.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The named resource does not exist. Maps to HTTP 404.
    #[error("{0}")]
    NotFound(String),

    /// Incompatible concurrent state: stale handle, name in use, running
    /// container removed without force. Maps to HTTP 409 and is the sole
    /// retriable class in lifecycle operations.
    #[error("{0}")]
    Conflict(String),

    /// Client-side validation failure. Maps to HTTP 400.
    #[error("{0}")]
    BadRequest(String),

    /// A streaming resource is in use by another operation. Maps to HTTP 423.
    #[error("Resource in use: {0}")]
    ResourceLocked(String),

    /// Everything else, including untyped transport errors that are not a
    /// clean end-of-stream. Maps to HTTP 500.
    #[error("Server error from portlayer: {0}")]
    Internal(String),

    /// The client typed the detach sequence during an attach session.
    #[error("detached from container")]
    Detach,

    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a not-found error naming the missing container.
    #[must_use]
    pub fn no_such_container(name: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("No such container: {name}"))
    }

    /// Creates a not-found error naming the missing image.
    #[must_use]
    pub fn no_such_image(name: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("No such image: {name}"))
    }

    /// Creates a generic not-found error.
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Creates a bad-request error.
    #[must_use]
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Creates a resource-locked error.
    #[must_use]
    pub fn locked(msg: impl Into<String>) -> Self {
        Self::ResourceLocked(msg.into())
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a conflict error.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if this is the detach pseudo-error.
    #[must_use]
    pub const fn is_detach(&self) -> bool {
        matches!(self, Self::Detach)
    }

    /// Returns true if this is a resource-locked error.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        matches!(self, Self::ResourceLocked(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_such_container_message() {
        let err = EngineError::no_such_container("web");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "No such container: web");
    }

    #[test]
    fn internal_carries_portlayer_prefix() {
        let err = EngineError::internal("commit failed");
        assert_eq!(err.to_string(), "Server error from portlayer: commit failed");
    }

    #[test]
    fn conflict_predicate() {
        assert!(EngineError::conflict("stale handle").is_conflict());
        assert!(!EngineError::not_found("x").is_conflict());
    }

    #[test]
    fn detach_is_not_http_visible_class() {
        let err = EngineError::Detach;
        assert!(err.is_detach());
        assert!(!err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn locked_message_names_the_resource() {
        let err = EngineError::locked("volume data-1");
        assert!(err.is_locked());
        assert_eq!(err.to_string(), "Resource in use: volume data-1");
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: EngineError = io.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
