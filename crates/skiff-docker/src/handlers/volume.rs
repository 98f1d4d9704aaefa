//! Volume handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use skiff_core::volume::{DEFAULT_VOLUME_STORE, VOLUME_DRIVER};
use skiff_portlayer::models::VolumeSpec;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::{VolumeCreateRequest, VolumeListResponse, VolumePruneResponse, VolumeSummary};

fn summarize(spec: &VolumeSpec) -> VolumeSummary {
    VolumeSummary {
        name: spec.name.clone(),
        driver: spec.driver.clone(),
        mountpoint: format!("{}/{}", spec.store, spec.name),
        labels: spec.labels.clone(),
        scope: "local".to_string(),
    }
}

/// `GET /volumes`
pub async fn list_volumes(State(state): State<AppState>) -> Result<Json<VolumeListResponse>> {
    let volumes = state.backend.list_volumes().await?;
    Ok(Json(VolumeListResponse {
        volumes: volumes.iter().map(summarize).collect(),
        warnings: Vec::new(),
    }))
}

/// `POST /volumes/create`
pub async fn create_volume(
    State(state): State<AppState>,
    Json(req): Json<VolumeCreateRequest>,
) -> Result<(StatusCode, Json<VolumeSummary>)> {
    if !matches!(req.driver.as_str(), "" | "local" | "vsphere") {
        return Err(DockerError::bad_parameter(format!(
            "error looking up volume plugin {}: plugin not found",
            req.driver
        )));
    }
    let spec = decode_create_request(req)?;
    let created = state.backend.create_volume(&spec).await?;
    Ok((StatusCode::CREATED, Json(summarize(&created))))
}

fn decode_create_request(req: VolumeCreateRequest) -> Result<VolumeSpec> {
    let capacity_mb = match req.driver_opts.get("Capacity") {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            DockerError::bad_parameter(format!("invalid capacity for volume: {raw}"))
        })?,
        None => -1,
    };
    let store = req
        .driver_opts
        .get("VolumeStore")
        .cloned()
        .unwrap_or_else(|| DEFAULT_VOLUME_STORE.to_string());
    let name = if req.name.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        req.name
    };
    Ok(VolumeSpec {
        name,
        driver: VOLUME_DRIVER.to_string(),
        store,
        capacity_mb,
        labels: req.labels,
    })
}

/// `GET /volumes/{name}`
pub async fn inspect_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VolumeSummary>> {
    let spec = state.backend.inspect_volume(&name).await?;
    Ok(Json(summarize(&spec)))
}

/// `DELETE /volumes/{name}`
pub async fn remove_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.backend.remove_volume(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct PruneQuery {
    #[serde(default)]
    pub filters: Option<String>,
}

/// `POST /volumes/prune`
///
/// Removes every volume no cached container mounts. In-use volumes are
/// skipped, not errors.
pub async fn prune_volumes(
    State(state): State<AppState>,
    Query(_query): Query<PruneQuery>,
) -> Result<Json<VolumePruneResponse>> {
    let mut deleted = Vec::new();
    for spec in state.backend.list_volumes().await? {
        match state.backend.remove_volume(&spec.name).await {
            Ok(()) => deleted.push(spec.name),
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Json(VolumePruneResponse {
        volumes_deleted: deleted,
        space_reclaimed: 0,
    }))
}
