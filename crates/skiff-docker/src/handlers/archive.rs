//! Archive (docker cp) handlers.
//!
//! GET streams a tar of the requested path, PUT extracts an uploaded tar at
//! the requested path, HEAD answers with the stat header only. All three
//! carry the `X-Docker-Container-Path-Stat` base64 JSON header.

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use skiff_portlayer::models::PathStat;
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::PathStatHeader;

/// Header naming per the Docker API.
pub const PATH_STAT_HEADER: &str = "X-Docker-Container-Path-Stat";

#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQuery {
    #[serde(default)]
    pub path: Option<String>,
}

fn require_path(query: &ArchiveQuery) -> Result<&str> {
    match query.path.as_deref() {
        Some(path) if !path.is_empty() => Ok(path),
        _ => Err(DockerError::bad_parameter("bad parameter: Path cannot be empty")),
    }
}

fn stat_header(stat: &PathStat) -> Result<String> {
    let header = PathStatHeader {
        name: stat.name.clone(),
        size: stat.size,
        mode: stat.mode,
        mtime: stat.mtime.to_rfc3339(),
        link_target: stat.link_target.clone(),
    };
    let json = serde_json::to_vec(&header).map_err(|e| DockerError::Server(e.to_string()))?;
    Ok(BASE64.encode(json))
}

/// `HEAD /containers/{id}/archive`
pub async fn head_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response> {
    let path = require_path(&query)?;
    let stat = state.backend.archive_stat(&id, path).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(PATH_STAT_HEADER, stat_header(&stat)?)
        .body(Body::empty())
        .map_err(|e| DockerError::Server(e.to_string()))
}

/// `GET /containers/{id}/archive`
pub async fn get_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response> {
    let path = require_path(&query)?;
    let stat = state.backend.archive_stat(&id, path).await?;
    let reader = state.backend.archive_export(&id, path).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-tar")
        .header(PATH_STAT_HEADER, stat_header(&stat)?)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| DockerError::Server(e.to_string()))
}

/// `PUT /containers/{id}/archive`
pub async fn put_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
    req: Request,
) -> Result<StatusCode> {
    let path = require_path(&query)?.to_string();
    let stream = req
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let reader = StreamReader::new(stream);
    state.backend.archive_import(&id, &path, reader).await?;
    Ok(StatusCode::OK)
}
