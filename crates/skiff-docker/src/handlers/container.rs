//! Container lifecycle, list, inspect, and stream handlers.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use bytes::BytesMut;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use skiff_core::attach::{frame_header, AttachConfig, DEFAULT_DETACH_KEYS, FRAME_STDOUT};
use skiff_core::volume::VOLUME_DRIVER;
use skiff_core::{Container, ContainerConfig, HostConfig, PortBinding, PortMap, RestartPolicy};
use skiff_portlayer::models::ContainerState;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::{
    docker_state_name, format_container_status, not_implemented, parse_bool, parse_detach_keys,
    parse_filters, render_time,
};
use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::{
    ContainerConfigWire, ContainerCreateRequest, ContainerCreateResponse,
    ContainerInspectResponse, ContainerStateWire, ContainerSummary, HostConfigWire,
    MountPointWire, NetworkSettingsWire, Port, PortBindingWire, RestartPolicyWire, WaitResponse,
};

// ============================================================================
// Create
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// `POST /containers/create`
pub async fn create_container(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    Json(req): Json<ContainerCreateRequest>,
) -> Result<(StatusCode, Json<ContainerCreateResponse>)> {
    validate_networking_config(&req)?;
    let (config, host_config) = decode_create_request(req);
    let container = state
        .backend
        .create(query.name, config, host_config)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id: container.id,
            warnings: Vec::new(),
        }),
    ))
}

fn validate_networking_config(req: &ContainerCreateRequest) -> Result<()> {
    let Some(networking) = &req.networking_config else {
        return Ok(());
    };
    if networking.endpoints_config.len() > 1 {
        let mut names: Vec<&str> = networking
            .endpoints_config
            .keys()
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        return Err(DockerError::bad_parameter(format!(
            "Container cannot be connected to network endpoints: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

fn decode_create_request(req: ContainerCreateRequest) -> (ContainerConfig, HostConfig) {
    let config = ContainerConfig {
        image: req.image,
        cmd: req.cmd.unwrap_or_default(),
        entrypoint: req.entrypoint.unwrap_or_default(),
        env: req.env.unwrap_or_default(),
        working_dir: req.working_dir,
        user: req.user,
        tty: req.tty,
        open_stdin: req.open_stdin,
        stdin_once: req.stdin_once,
        attach_stdin: req.attach_stdin,
        attach_stdout: req.attach_stdout,
        attach_stderr: req.attach_stderr,
        volumes: req
            .volumes
            .map(|v| v.into_keys().collect::<BTreeSet<_>>())
            .unwrap_or_default(),
        exposed_ports: req
            .exposed_ports
            .map(|p| p.into_keys().collect::<BTreeSet<_>>())
            .unwrap_or_default(),
        labels: req.labels.unwrap_or_default(),
        stop_signal: req.stop_signal,
        stop_timeout: req.stop_timeout,
    };

    let wire = req.host_config.unwrap_or_default();
    let host_config = HostConfig {
        memory_mb: wire.memory / (1024 * 1024),
        cpu_count: wire.cpu_count,
        binds: wire.binds.unwrap_or_default(),
        port_bindings: decode_port_bindings(wire.port_bindings.unwrap_or_default()),
        auto_remove: wire.auto_remove,
        network_mode: wire.network_mode,
        restart_policy: RestartPolicy {
            name: wire.restart_policy.name,
            maximum_retry_count: wire.restart_policy.maximum_retry_count,
        },
    };
    (config, host_config)
}

fn decode_port_bindings(
    wire: HashMap<String, Option<Vec<PortBindingWire>>>,
) -> PortMap {
    wire.into_iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .unwrap_or_else(|| vec![PortBindingWire::default()])
                .into_iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (port, bindings)
        })
        .collect()
}

// ============================================================================
// List
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: Option<String>,
}

/// `GET /containers/json`
pub async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerSummary>>> {
    let all = parse_bool(query.all.as_deref(), false);
    let filters = parse_filters(query.filters.as_deref())?;

    let mut summaries = Vec::new();
    for (container, cstate) in state.backend.list(all).await? {
        if !matches_ps_filters(&filters, &container, &cstate) {
            continue;
        }
        summaries.push(summarize(&container, &cstate));
        if let Some(limit) = query.limit {
            if limit > 0 && summaries.len() >= limit {
                break;
            }
        }
    }
    Ok(Json(summaries))
}

/// Applies `docker ps` filters: status exact, id/name exact or prefix,
/// label as `key` or `key=value`.
fn matches_ps_filters(
    filters: &HashMap<String, Vec<String>>,
    container: &Container,
    state: &ContainerState,
) -> bool {
    if let Some(statuses) = filters.get("status") {
        if !statuses.iter().any(|s| s == docker_state_name(state.status)) {
            return false;
        }
    }
    if let Some(ids) = filters.get("id") {
        if !ids.iter().any(|id| container.id.starts_with(id.as_str())) {
            return false;
        }
    }
    if let Some(names) = filters.get("name") {
        if !names
            .iter()
            .map(|n| n.trim_start_matches('/'))
            .any(|n| container.name.starts_with(n))
        {
            return false;
        }
    }
    if let Some(labels) = filters.get("label") {
        for label in labels {
            let matched = match label.split_once('=') {
                Some((key, value)) => {
                    container.config.labels.get(key).map(String::as_str) == Some(value)
                }
                None => container.config.labels.contains_key(label),
            };
            if !matched {
                return false;
            }
        }
    }
    true
}

fn summarize(container: &Container, state: &ContainerState) -> ContainerSummary {
    ContainerSummary {
        id: container.id.clone(),
        names: vec![format!("/{}", container.name)],
        image: container.config.image.clone(),
        image_id: container.image_id.clone(),
        command: container.command_line(),
        created: container.created.timestamp(),
        state: docker_state_name(state.status).to_string(),
        status: format_container_status(state),
        ports: ports_of(container),
        labels: container.config.labels.clone(),
        mounts: mounts_of(container),
    }
}

fn ports_of(container: &Container) -> Vec<Port> {
    let mut ports = Vec::new();
    for (spec, bindings) in &container.nat_map {
        let (private_port, proto) = split_port(spec);
        for binding in bindings {
            ports.push(Port {
                private_port,
                public_port: binding.host_port.parse().ok(),
                port_type: proto.to_string(),
                ip: Some(if binding.host_ip.is_empty() {
                    "0.0.0.0".to_string()
                } else {
                    binding.host_ip.clone()
                }),
            });
        }
    }
    for spec in &container.config.exposed_ports {
        if container.nat_map.contains_key(spec) {
            continue;
        }
        let (private_port, proto) = split_port(spec);
        ports.push(Port {
            private_port,
            public_port: None,
            port_type: proto.to_string(),
            ip: None,
        });
    }
    ports.sort_by_key(|p| (p.private_port, p.public_port));
    ports
}

fn split_port(spec: &str) -> (u16, &str) {
    let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
    (port.parse().unwrap_or(0), proto)
}

fn mounts_of(container: &Container) -> Vec<MountPointWire> {
    container
        .mounts
        .iter()
        .map(|m| MountPointWire {
            mount_type: "volume".to_string(),
            name: m.name.clone(),
            source: m.name.clone(),
            destination: m.destination.clone(),
            driver: VOLUME_DRIVER.to_string(),
            mode: m.flags.clone(),
            rw: m.flags != "ro",
        })
        .collect()
}

// ============================================================================
// Inspect
// ============================================================================

/// `GET /containers/{id}/json`
pub async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInspectResponse>> {
    let container = state.backend.require(&id)?;
    let cstate = state.backend.state(&id).await?;
    Ok(Json(inspect_response(&container, &cstate)))
}

fn inspect_response(
    container: &Container,
    state: &ContainerState,
) -> ContainerInspectResponse {
    let config = &container.config;
    let (path, args) = {
        let mut line = config.entrypoint.clone();
        line.extend(config.cmd.iter().cloned());
        let mut it = line.into_iter();
        (it.next().unwrap_or_default(), it.collect())
    };

    let mut ports: HashMap<String, Option<Vec<PortBindingWire>>> = config
        .exposed_ports
        .iter()
        .map(|spec| (spec.clone(), None))
        .collect();
    for (spec, bindings) in &container.nat_map {
        ports.insert(
            spec.clone(),
            Some(
                bindings
                    .iter()
                    .map(|b| PortBindingWire {
                        host_ip: if b.host_ip.is_empty() {
                            "0.0.0.0".to_string()
                        } else {
                            b.host_ip.clone()
                        },
                        host_port: b.host_port.clone(),
                    })
                    .collect(),
            ),
        );
    }

    ContainerInspectResponse {
        id: container.id.clone(),
        created: render_time(Some(container.created)),
        path,
        args,
        state: ContainerStateWire {
            status: docker_state_name(state.status).to_string(),
            running: state.running,
            dead: matches!(
                state.status,
                skiff_portlayer::models::ContainerStatus::Error
            ),
            exit_code: state.exit_code.unwrap_or(0),
            started_at: render_time(state.started_at),
            finished_at: render_time(state.finished_at),
            ..ContainerStateWire::default()
        },
        image: container.image_id.clone(),
        name: format!("/{}", container.name),
        restart_count: 0,
        driver: VOLUME_DRIVER.to_string(),
        host_config: echo_host_config(&container.host_config),
        config: ContainerConfigWire {
            hostname: container.id.chars().take(12).collect(),
            user: config.user.clone().unwrap_or_default(),
            attach_stdin: config.attach_stdin,
            attach_stdout: config.attach_stdout,
            attach_stderr: config.attach_stderr,
            exposed_ports: config
                .exposed_ports
                .iter()
                .map(|spec| (spec.clone(), serde_json::json!({})))
                .collect(),
            tty: config.tty,
            open_stdin: config.open_stdin,
            stdin_once: config.stdin_once,
            env: config.env.clone(),
            cmd: config.cmd.clone(),
            image: config.image.clone(),
            working_dir: config.working_dir.clone().unwrap_or_default(),
            entrypoint: config.entrypoint.clone(),
            labels: config.labels.clone(),
            stop_signal: config.stop_signal.clone(),
            stop_timeout: config.stop_timeout,
        },
        network_settings: NetworkSettingsWire {
            ports,
            ip_address: String::new(),
        },
        mounts: mounts_of(container),
    }
}

fn echo_host_config(host: &HostConfig) -> HostConfigWire {
    HostConfigWire {
        memory: host.memory_mb * 1024 * 1024,
        cpu_count: host.cpu_count,
        binds: Some(host.binds.clone()),
        port_bindings: Some(
            host.port_bindings
                .iter()
                .map(|(spec, bindings)| {
                    (
                        spec.clone(),
                        Some(
                            bindings
                                .iter()
                                .map(|b| PortBindingWire {
                                    host_ip: b.host_ip.clone(),
                                    host_port: b.host_port.clone(),
                                })
                                .collect(),
                        ),
                    )
                })
                .collect(),
        ),
        auto_remove: host.auto_remove,
        network_mode: host.network_mode.clone(),
        restart_policy: RestartPolicyWire {
            name: host.restart_policy.name.clone(),
            maximum_retry_count: host.restart_policy.maximum_retry_count,
        },
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TimeoutQuery {
    /// Grace period in seconds.
    #[serde(default)]
    pub t: Option<i64>,
}

/// `POST /containers/{id}/start`
pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.backend.start(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{id}/stop`
pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TimeoutQuery>,
) -> Result<StatusCode> {
    let timeout = query.t.map(|t| Duration::from_secs(t.max(0) as u64));
    state.backend.stop(&id, timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{id}/restart`
pub async fn restart_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TimeoutQuery>,
) -> Result<StatusCode> {
    let timeout = query.t.map(|t| Duration::from_secs(t.max(0) as u64));
    state.backend.restart(&id, timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct KillQuery {
    #[serde(default)]
    pub signal: Option<String>,
}

/// `POST /containers/{id}/kill`
pub async fn kill_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<StatusCode> {
    let signal = parse_signal(query.signal.as_deref().unwrap_or("SIGKILL"))?;
    state.backend.kill(&id, signal).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_signal(signal: &str) -> Result<i64> {
    if let Ok(number) = signal.parse::<i64>() {
        return Ok(number);
    }
    let number = match signal.trim().trim_start_matches("SIG").to_uppercase().as_str() {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "KILL" => 9,
        "USR1" => 10,
        "USR2" => 12,
        "TERM" => 15,
        "CONT" => 18,
        "STOP" => 19,
        "WINCH" => 28,
        _ => {
            return Err(DockerError::bad_parameter(format!(
                "Invalid signal: {signal}"
            )));
        }
    };
    Ok(number)
}

#[derive(Debug, Default, Deserialize)]
pub struct RenameQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// `POST /containers/{id}/rename`
pub async fn rename_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RenameQuery>,
) -> Result<StatusCode> {
    let name = query
        .name
        .ok_or_else(|| DockerError::bad_parameter("Neither old nor new names may be empty"))?;
    state.backend.rename(&id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/{id}/wait`
pub async fn wait_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WaitResponse>> {
    let cstate = state.backend.wait(&id, None).await?;
    Ok(Json(WaitResponse {
        status_code: i64::from(cstate.exit_code.unwrap_or(0)),
        error: None,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: Option<String>,
    #[serde(default)]
    pub v: Option<String>,
}

/// `DELETE /containers/{id}`
pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode> {
    let force = parse_bool(query.force.as_deref(), false);
    let remove_volumes = parse_bool(query.v.as_deref(), false);
    state.backend.remove(&id, force, remove_volumes).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct ResizeQuery {
    #[serde(default)]
    pub h: Option<u32>,
    #[serde(default)]
    pub w: Option<u32>,
}

/// `POST /containers/{id}/resize`
pub async fn resize_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> Result<StatusCode> {
    let (Some(h), Some(w)) = (query.h, query.w) else {
        return Err(DockerError::bad_parameter("resize requires h and w"));
    };
    state.backend.resize(&id, h, w).await?;
    Ok(StatusCode::OK)
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub timestamps: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub tail: Option<String>,
}

/// `GET /containers/{id}/logs`
pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    if !parse_bool(query.stdout.as_deref(), false) && !parse_bool(query.stderr.as_deref(), false) {
        return Err(DockerError::bad_parameter(
            "Bad parameters: you must choose at least one stream",
        ));
    }
    let follow = parse_bool(query.follow.as_deref(), false);
    let timestamps = parse_bool(query.timestamps.as_deref(), false);
    let since = match query.since.as_deref() {
        None | Some("") | Some("0") => None,
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            DockerError::bad_parameter(format!("invalid since timestamp: {raw}"))
        })?),
    };
    let tail = match query.tail.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            DockerError::bad_parameter(format!("invalid tail value: {raw}"))
        })?),
    };

    let (container, reader) = state
        .backend
        .logs(&id, follow, timestamps, since, tail)
        .await?;

    // The guest log stream is a single channel: framed as stdout when the
    // container has no tty, raw otherwise.
    let tty = container.config.tty;
    let stream = ReaderStream::new(reader).map(move |chunk| {
        chunk.map(|bytes| {
            if tty {
                bytes
            } else {
                let mut framed = BytesMut::with_capacity(bytes.len() + 8);
                framed.extend_from_slice(&frame_header(FRAME_STDOUT, bytes.len()));
                framed.extend_from_slice(&bytes);
                framed.freeze()
            }
        })
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.docker.raw-stream")
        .body(Body::from_stream(stream))
        .map_err(|e| DockerError::Server(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub stream: Option<String>,
}

/// `GET /containers/{id}/stats`
pub async fn container_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Response> {
    let stream = parse_bool(query.stream.as_deref(), true);
    let reader = state.backend.stats(&id, stream).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| DockerError::Server(e.to_string()))
}

// ============================================================================
// Attach
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AttachQuery {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(rename = "detachKeys", default)]
    pub detach_keys: Option<String>,
}

/// `POST /containers/{id}/attach`
///
/// Hijacks the connection via HTTP upgrade and runs one attach session over
/// the raw stream. A client-side detach ends the session cleanly.
pub async fn attach_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AttachQuery>,
    mut req: Request,
) -> Result<Response> {
    // Resolve up front so a bad id is a 404, not a broken upgrade.
    let container = state.backend.require(&id)?;

    let detach_keys = match query.detach_keys.as_deref() {
        Some(spec) if !spec.is_empty() => parse_detach_keys(spec)?,
        _ => DEFAULT_DETACH_KEYS.to_vec(),
    };
    let config = AttachConfig {
        tty: container.config.tty,
        stdin: parse_bool(query.stdin.as_deref(), false),
        stdout: parse_bool(query.stdout.as_deref(), false),
        stderr: parse_bool(query.stderr.as_deref(), false),
        detach_keys,
    };
    let replay_logs = parse_bool(query.logs.as_deref(), false);
    let run_stream = parse_bool(query.stream.as_deref(), false);

    let on_upgrade = hyper::upgrade::on(&mut req);
    let backend = state.backend.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(id = %container.id, "attach upgrade failed: {e}");
                return;
            }
        };
        let (read, mut write) = tokio::io::split(TokioIo::new(upgraded));

        if replay_logs {
            if let Err(e) = replay_log_tail(&backend, &container, &mut write).await {
                warn!(id = %container.id, "attach log replay failed: {e}");
            }
        }
        if run_stream {
            if let Err(e) = backend.attach(&container.id, config, read, write).await {
                warn!(id = %container.id, "attach session ended with error: {e}");
            }
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

/// Streams the existing log content into the hijacked connection, framed the
/// same way the live session will be.
async fn replay_log_tail<W>(
    backend: &skiff_core::ContainerBackend,
    container: &Container,
    write: &mut W,
) -> skiff_error::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let (_, mut reader) = backend
        .logs(&container.id, false, false, None, None)
        .await?;
    if container.config.tty {
        tokio::io::copy(&mut reader, write).await?;
    } else {
        let mut buf = [0_u8; 4096];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            write.write_all(&frame_header(FRAME_STDOUT, n)).await?;
            write.write_all(&buf[..n]).await?;
        }
    }
    write.flush().await?;
    Ok(())
}

// ============================================================================
// Not implemented
// ============================================================================

pub async fn pause_container() -> DockerError {
    not_implemented("pause")
}

pub async fn unpause_container() -> DockerError {
    not_implemented("unpause")
}

pub async fn update_container() -> DockerError {
    not_implemented("update")
}

pub async fn container_top() -> DockerError {
    not_implemented("top")
}

pub async fn container_changes() -> DockerError {
    not_implemented("diff")
}

pub async fn export_container() -> DockerError {
    not_implemented("export")
}

pub async fn prune_containers() -> DockerError {
    not_implemented("container prune")
}

pub async fn container_checkpoints() -> DockerError {
    not_implemented("checkpoint")
}
