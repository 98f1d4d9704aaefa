//! Image handlers, answered from the image cache.

use axum::extract::{Path, State};
use axum::Json;
use skiff_cache::ImageConfig;

use super::not_implemented;
use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::{ImageInspectResponse, ImageSummary};

fn repo_tags(image: &ImageConfig) -> Vec<String> {
    image
        .tags
        .iter()
        .map(|tag| format!("{}:{tag}", image.name))
        .collect()
}

/// `GET /images/json`
pub async fn list_images(State(state): State<AppState>) -> Json<Vec<ImageSummary>> {
    let mut images: Vec<ImageSummary> = state
        .backend
        .images()
        .list()
        .iter()
        .map(|image| ImageSummary {
            id: image.image_id.clone(),
            parent_id: image.parent.clone().unwrap_or_default(),
            repo_tags: repo_tags(image),
            repo_digests: image.digests.clone(),
            created: image.created.timestamp(),
            size: image.size,
            virtual_size: image.size,
            labels: std::collections::HashMap::new(),
        })
        .collect();
    images.sort_by(|a, b| b.created.cmp(&a.created));
    Json(images)
}

/// `GET /images/{name}/json`
pub async fn inspect_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ImageInspectResponse>> {
    let image = state.backend.images().get(&name)?;
    Ok(Json(ImageInspectResponse {
        id: image.image_id.clone(),
        repo_tags: repo_tags(&image),
        repo_digests: image.digests.clone(),
        created: image.created.to_rfc3339(),
        architecture: image.architecture.clone(),
        os: image.os.clone(),
        size: image.size,
        virtual_size: image.size,
    }))
}

pub async fn pull_image() -> DockerError {
    not_implemented("image pull")
}

pub async fn remove_image() -> DockerError {
    not_implemented("image remove")
}

pub async fn tag_image() -> DockerError {
    not_implemented("image tag")
}

pub async fn push_image() -> DockerError {
    not_implemented("image push")
}
