//! # skiff-docker
//!
//! Docker Engine API surface for Skiff.
//!
//! Terminates the Docker REST API on a unix socket and translates each
//! request into [`skiff_core::ContainerBackend`] operations. Routing covers
//! the compatibility paths `v1.24..v1.43` plus the unversioned forms, so an
//! unmodified `docker` CLI can point at the socket:
//!
//! ```bash
//! docker -H unix:///home/you/.skiff/docker.sock ps
//! ```
//!
//! Attach and interactive exec hijack the connection through an HTTP
//! upgrade; everything else is plain request/response JSON or a chunked
//! stream (logs, stats, events, archive).

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod api;
pub mod error;
pub mod handlers;
pub mod server;
// Docker wire shapes carry many fields only ever serialized or deserialized.
#[allow(dead_code)]
pub mod types;

pub use api::{create_router, AppState};
pub use error::{DockerError, Result};
pub use server::{DockerApiServer, ServerConfig};

/// Highest Docker Engine API version the personality answers for.
pub const API_VERSION: &str = "1.43";
/// Oldest version still routed.
pub const MIN_API_VERSION: &str = "1.24";
