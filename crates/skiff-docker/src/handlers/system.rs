//! System handlers: ping, version, info, and the build/commit stubs.

use std::sync::OnceLock;

use axum::extract::State;
use axum::Json;

use super::not_implemented;
use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::{SystemInfoResponse, VersionResponse};
use crate::{API_VERSION, MIN_API_VERSION};

/// `GET|HEAD /_ping`
pub async fn ping() -> &'static str {
    "OK"
}

/// `GET /version`
pub async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION.to_string(),
        min_api_version: MIN_API_VERSION.to_string(),
        git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
        go_version: "N/A (Rust)".to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    })
}

/// Daemon identity reported by `/info`, fixed for the life of the process.
fn daemon_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// `GET /info`
pub async fn get_info(State(state): State<AppState>) -> Result<Json<SystemInfoResponse>> {
    let containers = state.backend.list(true).await?;
    let running = containers.iter().filter(|(_, s)| s.running).count();
    let stopped = containers.len() - running;
    Ok(Json(SystemInfoResponse {
        id: daemon_id().to_string(),
        containers: containers.len(),
        containers_running: running,
        containers_paused: 0,
        containers_stopped: stopped,
        images: state.backend.images().list().len(),
        driver: "vsphere".to_string(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        operating_system: std::env::consts::OS.to_string(),
        os_type: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        name: "skiff".to_string(),
    }))
}

pub async fn commit() -> DockerError {
    not_implemented("commit")
}

pub async fn build() -> DockerError {
    not_implemented("build")
}

pub async fn swarm() -> DockerError {
    not_implemented("swarm")
}
