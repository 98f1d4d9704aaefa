//! Engine error taxonomy shared across the Skiff crates.
//!
//! The port-layer proxy is the only place wire errors are translated into
//! this taxonomy; everything above it switches on the variants or on the
//! `is_*` predicates and never inspects the underlying transport error.

mod engine;

pub use engine::EngineError;

/// Result type alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;
