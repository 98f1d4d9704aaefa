//! Typed client surface for the port layer.
//!
//! The port layer is the remote service that owns hypervisor-backed container
//! state. This crate wraps its RPC surface behind the [`PortLayer`] trait,
//! translates wire errors into the engine taxonomy exactly once, and
//! materializes streaming endpoints as `AsyncRead`/`AsyncWrite` values.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod http;
pub mod models;
pub mod stream;
mod surface;

pub use http::{HttpPortLayer, PortLayerConfig};
pub use stream::{ByteReader, ByteWriter, EofTolerantReader};
pub use surface::{KvStore, PortLayer};

/// Substring used by the wire layer to signal a natural end-of-stream on
/// long-lived requests. Errors carrying it are clean terminations.
pub const EOF_MARKER: &str = "EOF";

/// Returns true when an error string denotes a natural end-of-stream.
#[must_use]
pub fn is_stream_eof(msg: &str) -> bool {
    msg.contains(EOF_MARKER)
}
