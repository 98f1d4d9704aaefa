//! Core engine of the Skiff personality.
//!
//! Composes port-layer primitives into container operations: the handle-based
//! lifecycle orchestrator, the attach multiplexer, the archive copy engine,
//! the port-ownership map, and the event bridge.

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod archive;
pub mod attach;
mod backend;
pub mod config;
mod container;
pub mod event;
pub mod filter;
mod monitor;
mod names;
pub mod pathtrie;
pub mod ports;
mod retry;
#[cfg(test)]
pub(crate) mod testutil;
pub mod volume;

pub use backend::{ContainerBackend, ExecConfig};
pub use container::{Container, ContainerConfig, HostConfig, MountPoint, PortBinding, PortMap, RestartPolicy};
pub use monitor::EventMonitor;
pub use names::generate_name;
pub use retry::retry_on_conflict;
