//! Docker API router.
//!
//! Routes the Docker Engine API compatibility paths `v1.24..v1.43` plus the
//! unversioned forms. See <https://docs.docker.com/engine/api/v1.43/>.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use skiff_core::ContainerBackend;

use crate::handlers::{archive, container, events, exec, image, network, system, volume};

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// The engine driving the port layer.
    pub backend: Arc<ContainerBackend>,
}

/// Creates the Docker API router with all endpoints.
#[must_use]
pub fn create_router(backend: Arc<ContainerBackend>) -> Router {
    let state = AppState { backend };

    let mut router = api_routes();
    for minor in 24..=43 {
        router = router.nest(&format!("/v1.{minor}"), api_routes());
    }

    router.fallback(fallback).with_state(state)
}

async fn fallback() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"message": "page not found"})),
    )
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/_ping", get(system::ping).head(system::ping))
        .route("/version", get(system::get_version))
        .route("/info", get(system::get_info))
        .route("/events", get(events::events))
        .route("/containers/json", get(container::list_containers))
        .route("/containers/create", post(container::create_container))
        .route("/containers/prune", post(container::prune_containers))
        .route("/containers/{id}/json", get(container::inspect_container))
        .route("/containers/{id}/start", post(container::start_container))
        .route("/containers/{id}/stop", post(container::stop_container))
        .route("/containers/{id}/restart", post(container::restart_container))
        .route("/containers/{id}/kill", post(container::kill_container))
        .route("/containers/{id}/rename", post(container::rename_container))
        .route("/containers/{id}/wait", post(container::wait_container))
        .route("/containers/{id}/logs", get(container::container_logs))
        .route("/containers/{id}/stats", get(container::container_stats))
        .route("/containers/{id}/resize", post(container::resize_container))
        .route("/containers/{id}/attach", post(container::attach_container))
        .route("/containers/{id}/pause", post(container::pause_container))
        .route("/containers/{id}/unpause", post(container::unpause_container))
        .route("/containers/{id}/update", post(container::update_container))
        .route("/containers/{id}/top", get(container::container_top))
        .route("/containers/{id}/changes", get(container::container_changes))
        .route("/containers/{id}/export", get(container::export_container))
        .route("/containers/{id}", delete(container::remove_container))
        .route(
            "/containers/{id}/checkpoints",
            get(container::container_checkpoints).post(container::container_checkpoints),
        )
        .route(
            "/containers/{id}/archive",
            get(archive::get_archive)
                .put(archive::put_archive)
                .head(archive::head_archive),
        )
        .route("/containers/{id}/exec", post(exec::exec_create))
        .route("/exec/{id}/start", post(exec::exec_start))
        .route("/exec/{id}/resize", post(exec::exec_resize))
        .route("/exec/{id}/json", get(exec::exec_inspect))
        .route("/commit", post(system::commit))
        .route("/build", post(system::build))
        .route("/swarm", get(system::swarm))
        .route("/swarm/init", post(system::swarm))
        .route("/swarm/join", post(system::swarm))
        .route("/swarm/leave", post(system::swarm))
        .route("/swarm/update", post(system::swarm))
        .route("/images/json", get(image::list_images))
        .route("/images/create", post(image::pull_image))
        .route("/images/{name}/json", get(image::inspect_image))
        .route("/images/{name}/tag", post(image::tag_image))
        .route("/images/{name}/push", post(image::push_image))
        .route("/images/{name}", delete(image::remove_image))
        .route("/networks", get(network::list_networks))
        .route("/networks/create", post(network::create_network))
        .route(
            "/networks/{id}",
            get(network::inspect_network).delete(network::remove_network),
        )
        .route("/volumes", get(volume::list_volumes))
        .route("/volumes/create", post(volume::create_volume))
        .route("/volumes/prune", post(volume::prune_volumes))
        .route(
            "/volumes/{name}",
            get(volume::inspect_volume).delete(volume::remove_volume),
        )
}
