//! Exec session handlers.

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use skiff_core::attach::{AttachConfig, DEFAULT_DETACH_KEYS};
use skiff_core::ExecConfig;
use tracing::warn;

use super::parse_detach_keys;
use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::{
    ExecCreateRequest, ExecCreateResponse, ExecInspectResponse, ExecProcessConfig,
    ExecStartRequest,
};

/// `POST /containers/{id}/exec`
pub async fn exec_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecCreateRequest>,
) -> Result<(StatusCode, Json<ExecCreateResponse>)> {
    if let Some(keys) = req.detach_keys.as_deref() {
        if !keys.is_empty() {
            // Validated here so a bad sequence fails the create, matching the CLI.
            parse_detach_keys(keys)?;
        }
    }
    let config = ExecConfig {
        cmd: req.cmd,
        env: req.env.unwrap_or_default(),
        user: req.user,
        working_dir: req.working_dir,
        tty: req.tty,
        attach_stdin: req.attach_stdin,
        attach_stdout: req.attach_stdout,
        attach_stderr: req.attach_stderr,
    };
    let exec_id = state.backend.exec_create(&id, &config).await?;
    Ok((
        StatusCode::CREATED,
        Json(ExecCreateResponse { id: exec_id }),
    ))
}

/// `POST /exec/{id}/start`
///
/// Detached starts answer 200 once the task is bound. Interactive starts
/// hijack the connection and run an attach session against the exec's
/// container streams.
pub async fn exec_start(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
    mut req: Request,
) -> Result<Response> {
    let body = axum::body::to_bytes(
        std::mem::replace(req.body_mut(), Body::empty()),
        64 * 1024,
    )
    .await
    .map_err(|e| DockerError::Server(e.to_string()))?;
    let start: ExecStartRequest = if body.is_empty() {
        ExecStartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| DockerError::bad_parameter(format!("invalid exec start body: {e}")))?
    };

    if start.detach {
        state.backend.exec_start(&exec_id).await?;
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .map_err(|e| DockerError::Server(e.to_string()));
    }

    // Resolve before the upgrade so unknown exec ids answer 404.
    let (container, task) = state.backend.exec_inspect(&exec_id).await?;
    let process = task.process_config.unwrap_or_default();
    let config = AttachConfig {
        tty: start.tty || process.tty,
        stdin: process.open_stdin,
        stdout: true,
        stderr: !(start.tty || process.tty),
        detach_keys: DEFAULT_DETACH_KEYS.to_vec(),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let backend = state.backend.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(exec = %exec_id, "exec upgrade failed: {e}");
                return;
            }
        };
        if let Err(e) = backend.exec_start(&exec_id).await {
            warn!(exec = %exec_id, "exec start failed: {e}");
            return;
        }
        let (read, write) = tokio::io::split(TokioIo::new(upgraded));
        if let Err(e) = backend.attach(&container.id, config, read, write).await {
            warn!(exec = %exec_id, "exec session ended with error: {e}");
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "tcp")
        .header(header::CONTENT_TYPE, "application/vnd.docker.raw-stream")
        .body(Body::empty())
        .map_err(|e| DockerError::Server(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecResizeQuery {
    #[serde(default)]
    pub h: Option<u32>,
    #[serde(default)]
    pub w: Option<u32>,
}

/// `POST /exec/{id}/resize`
pub async fn exec_resize(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
    Query(query): Query<ExecResizeQuery>,
) -> Result<StatusCode> {
    let (Some(h), Some(w)) = (query.h, query.w) else {
        return Err(DockerError::bad_parameter("resize requires h and w"));
    };
    let (container, _) = state.backend.exec_inspect(&exec_id).await?;
    state.backend.resize(&container.id, h, w).await?;
    Ok(StatusCode::OK)
}

/// `GET /exec/{id}/json`
pub async fn exec_inspect(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> Result<Json<ExecInspectResponse>> {
    let (container, task) = state.backend.exec_inspect(&exec_id).await?;
    let process = task.process_config.unwrap_or_default();
    Ok(Json(ExecInspectResponse {
        id: task.id,
        running: task.running,
        exit_code: task.exit_code,
        process_config: ExecProcessConfig {
            tty: process.tty,
            entrypoint: process.path,
            arguments: process.args,
            user: process.user.unwrap_or_default(),
        },
        open_stdin: process.open_stdin,
        open_stdout: true,
        open_stderr: !process.tty,
        container_id: container.id,
        pid: 0,
    }))
}
