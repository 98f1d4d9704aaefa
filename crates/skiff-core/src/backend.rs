//! Handle-based lifecycle orchestration.
//!
//! Every mutation follows the same shape: open a handle, thread it through
//! the joins and state changes the operation needs, then commit. A conflict
//! on commit means another actor won the race; the operation is retried
//! from a fresh handle. Everything the engine believes about containers is
//! re-checkable against the port layer, so caches are evicted, never
//! trusted, when the remote side disagrees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skiff_cache::{ContainerCache, ImageCache};
use skiff_error::{EngineError, Result};
use skiff_portlayer::PortLayer;
use skiff_portlayer::models::{
    ContainerCreateSpec, ContainerState, ContainerStatus, PathStat, PortLayerEvent, PowerState,
    ScopeJoinSpec, TaskSpec, TaskState, VolumeJoinSpec, VolumeSpec, event_kind,
};
use skiff_portlayer::stream::ByteReader;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{self, ArchiveWriterMap};
use crate::attach::{self, AttachConfig};
use crate::config;
use crate::container::{Container, ContainerConfig, HostConfig, PortBinding, PortMap};
use crate::event::{EngineEvent, EventActor, EventBus, action};
use crate::names;
use crate::ports::{PortForwarder, PortOwnership};
use crate::retry::retry_on_conflict;
use crate::volume;

/// Scope containers join when the request names no network.
const DEFAULT_SCOPE: &str = "bridge";

/// Exit code reported on `die` when the real code cannot be read back.
const FALLBACK_EXIT_CODE: i32 = 125;

/// Exec session parameters.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

/// The engine: owns the caches and drives the port layer.
pub struct ContainerBackend {
    portlayer: Arc<dyn PortLayer>,
    containers: ContainerCache<Container>,
    images: ImageCache,
    ports: PortOwnership,
    forwarder: Arc<dyn PortForwarder>,
    events: EventBus,
    public_ip: Option<String>,
}

impl ContainerBackend {
    #[must_use]
    pub fn new(
        portlayer: Arc<dyn PortLayer>,
        forwarder: Arc<dyn PortForwarder>,
        public_ip: Option<String>,
    ) -> Self {
        Self {
            portlayer,
            containers: ContainerCache::new(),
            images: ImageCache::new(),
            ports: PortOwnership::new(),
            forwarder,
            events: EventBus::new(),
            public_ip,
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    #[must_use]
    pub fn containers(&self) -> &ContainerCache<Container> {
        &self.containers
    }

    #[must_use]
    pub fn portlayer(&self) -> &Arc<dyn PortLayer> {
        &self.portlayer
    }

    #[must_use]
    pub fn public_ip(&self) -> Option<&str> {
        self.public_ip.as_deref()
    }

    /// Resolves a name, id, or id prefix to a cached container.
    pub fn require(&self, key: &str) -> Result<Container> {
        self.containers
            .get(key)?
            .ok_or_else(|| EngineError::no_such_container(key))
    }

    fn actor(&self, container: &Container) -> EventActor {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), container.name.clone());
        attributes.insert("image".to_string(), container.config.image.clone());
        EventActor {
            id: container.id.clone(),
            attributes,
        }
    }

    fn emit(&self, what: impl Into<String>, container: &Container) {
        self.events
            .publish(EngineEvent::container(what, self.actor(container)));
    }

    // ---- create ----

    pub async fn create(
        &self,
        name: Option<String>,
        mut config: ContainerConfig,
        mut host: HostConfig,
    ) -> Result<Container> {
        let image = self.images.get(&config.image)?;
        let name = name.unwrap_or_else(names::generate_name);
        validate_name(&name)?;
        self.containers.reserve_name(&name)?;

        match self
            .create_reserved(&name, &mut config, &mut host, &image)
            .await
        {
            Ok(container) => {
                self.containers.add(container.clone());
                info!(id = %container.id, name = %container.name, "container created");
                self.emit(action::CREATE, &container);
                Ok(container)
            }
            Err(e) => {
                self.containers.release_name(&name);
                Err(e)
            }
        }
    }

    async fn create_reserved(
        &self,
        name: &str,
        config: &mut ContainerConfig,
        host: &mut HostConfig,
        image: &skiff_cache::ImageConfig,
    ) -> Result<Container> {
        config::apply_image_defaults(config, &image.config);
        config::validate_and_normalize(config, host, self.public_ip.as_deref())?;
        let mounts = volume::resolve_mounts(&host.binds, config.volumes.iter().cloned())?;

        let spec = ContainerCreateSpec {
            name: name.to_string(),
            image_id: image.image_id.clone(),
            layer_id: image.layer_id.clone(),
            repo_name: image.name.clone(),
            memory_mb: host.memory_mb,
            cpu_count: i32::try_from(host.cpu_count).unwrap_or(i32::MAX),
            stop_signal: config.stop_signal.clone(),
        };
        let (id, handle) = self.portlayer.create_container(&spec).await?;

        let built: Result<()> = async {
            let mut command = config.entrypoint.clone();
            command.extend(config.cmd.iter().cloned());
            let task = TaskSpec {
                id: id.clone(),
                path: command.first().cloned().unwrap_or_default(),
                args: command.get(1..).unwrap_or_default().to_vec(),
                env: config.env.clone(),
                working_dir: config.working_dir.clone(),
                user: config.user.clone(),
                tty: config.tty,
                open_stdin: config.open_stdin,
                primary: true,
            };
            let (handle, _) = self.portlayer.task_join(handle, &task).await?;
            let handle = self.portlayer.task_bind(handle, &id, &id).await?;

            let scope = match host.network_mode.as_str() {
                "" | "default" => DEFAULT_SCOPE.to_string(),
                named => named.to_string(),
            };
            let join = ScopeJoinSpec {
                scope,
                aliases: Vec::new(),
                ports: config.exposed_ports.iter().cloned().collect(),
                ip: None,
            };
            let handle = self.portlayer.scope_add(handle, &join).await?;
            let handle = self.portlayer.interaction_join(handle).await?;
            let mut handle = self.portlayer.logging_join(handle).await?;

            for mount in &mounts {
                match self.portlayer.create_volume(&volume::volume_spec(mount)).await {
                    Ok(_) => {}
                    // A named volume that already exists is reused as-is.
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
                let join = VolumeJoinSpec {
                    volume: mount.name.clone(),
                    mount_path: mount.destination.clone(),
                    flags: mount.flags.clone(),
                };
                handle = self.portlayer.volume_join(handle, &join).await?;
            }

            self.portlayer.commit(handle, &id, None).await
        }
        .await;

        if let Err(e) = built {
            self.rollback_create(&id).await;
            return Err(e);
        }

        Ok(Container {
            id,
            name: name.to_string(),
            image_id: image.image_id.clone(),
            layer_id: image.layer_id.clone(),
            config: config.clone(),
            host_config: host.clone(),
            mounts,
            nat_map: HashMap::new(),
            created: Utc::now(),
        })
    }

    /// Undoes the committed side effects of a failed create. Best-effort:
    /// an uncommitted handle evaporates on its own, only scope membership
    /// needs an explicit inverse.
    async fn rollback_create(&self, id: &str) {
        let result: Result<()> = async {
            let handle = self.portlayer.handle(id).await?;
            let handle = self.portlayer.scope_remove(handle, id).await?;
            self.portlayer.commit(handle, id, None).await
        }
        .await;
        if let Err(e) = result {
            debug!(id, "create rollback: {e}");
        }
    }

    // ---- start / stop ----

    pub async fn start(&self, key: &str) -> Result<()> {
        let container = self.require(key)?;
        let nat = retry_on_conflict("start", || self.start_once(&container)).await?;

        if let Some(mut cached) = self.containers.get(&container.id)? {
            cached.nat_map = nat;
            self.containers.add(cached.clone());
            self.emit(action::START, &cached);
        }
        Ok(())
    }

    async fn start_once(&self, container: &Container) -> Result<PortMap> {
        let id = &container.id;
        let handle = match self.portlayer.handle(id).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                self.containers.delete(id);
                return Err(EngineError::no_such_container(id));
            }
            Err(e) => return Err(e),
        };

        self.reap_stale_port_owners(container).await?;
        let handle = self.portlayer.scope_bind(handle, id).await?;
        let nat = self.map_ports(container).await?;

        let committed: Result<()> = async {
            let handle = self.portlayer.state_change(handle, PowerState::Running).await?;
            self.portlayer.commit(handle, id, None).await
        }
        .await;

        if let Err(e) = committed {
            self.unmap_ports(id, &nat).await;
            return Err(e);
        }
        Ok(nat)
    }

    /// Frees host ports whose recorded owner is no longer running. A live
    /// owner makes the port genuinely busy and fails the start.
    async fn reap_stale_port_owners(&self, container: &Container) -> Result<()> {
        for bindings in container.host_config.port_bindings.values() {
            for binding in bindings {
                let Ok(port) = binding.host_port.parse::<u16>() else {
                    continue;
                };
                let Some(owner) = self.ports.owner(port) else {
                    continue;
                };
                if owner == container.id {
                    continue;
                }
                match self.portlayer.state(&owner).await {
                    Ok(state) if state.running => {
                        return Err(EngineError::internal(format!(
                            "host port {port} is already in use by container {owner}"
                        )));
                    }
                    Ok(_) => self.release_owner_ports(&owner).await,
                    Err(e) if e.is_not_found() => {
                        self.containers.delete(&owner);
                        self.release_owner_ports(&owner).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn release_owner_ports(&self, owner: &str) {
        let nat = self
            .containers
            .get(owner)
            .ok()
            .flatten()
            .map(|c| c.nat_map)
            .unwrap_or_default();
        for port in self.ports.release_all(owner) {
            let proto = nat
                .iter()
                .find(|(_, bindings)| {
                    bindings.iter().any(|b| b.host_port == port.to_string())
                })
                .and_then(|(spec, _)| config::parse_port_proto(spec).ok())
                .map_or_else(|| "tcp".to_string(), |(_, proto)| proto.to_string());
            if let Err(e) = self.forwarder.unmap(port, &proto).await {
                warn!(port, "failed to unmap stale port: {e}");
            }
        }
    }

    async fn map_ports(&self, container: &Container) -> Result<PortMap> {
        let mut nat: PortMap = HashMap::new();
        let mut mapped: Vec<(u16, String)> = Vec::new();

        let result: Result<()> = async {
            for (spec, bindings) in &container.host_config.port_bindings {
                let (container_port, proto) = config::parse_port_proto(spec)?;
                for binding in bindings {
                    let host_port = if binding.host_port.is_empty() {
                        self.ports.allocate_ephemeral()?
                    } else {
                        binding.host_port.parse::<u16>().map_err(|_| {
                            EngineError::bad_request(format!(
                                "invalid host port: {}",
                                binding.host_port
                            ))
                        })?
                    };
                    self.ports.claim(host_port, &container.id)?;
                    self.forwarder
                        .map(host_port, &container.id, container_port, proto)
                        .await?;
                    mapped.push((host_port, proto.to_string()));
                    nat.entry(spec.clone()).or_default().push(PortBinding {
                        host_ip: if binding.host_ip.is_empty() {
                            "0.0.0.0".to_string()
                        } else {
                            binding.host_ip.clone()
                        },
                        host_port: host_port.to_string(),
                    });
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            for (port, proto) in mapped {
                self.ports.release(port);
                let _ = self.forwarder.unmap(port, &proto).await;
            }
            return Err(e);
        }
        Ok(nat)
    }

    async fn unmap_ports(&self, id: &str, nat: &PortMap) {
        for (spec, bindings) in nat {
            let proto = config::parse_port_proto(spec).map_or("tcp", |(_, proto)| proto);
            for binding in bindings {
                let Ok(port) = binding.host_port.parse::<u16>() else {
                    continue;
                };
                if self.ports.owner(port).as_deref() == Some(id) {
                    self.ports.release(port);
                    if let Err(e) = self.forwarder.unmap(port, proto).await {
                        warn!(port, "failed to unmap port: {e}");
                    }
                }
            }
        }
    }

    pub async fn stop(&self, key: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.require(key)?;
        if self.stop_container(&container, timeout).await? {
            self.emit(action::STOP, &container);
        }
        Ok(())
    }

    /// Returns false when the container was not running to begin with.
    async fn stop_container(
        &self,
        container: &Container,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let id = &container.id;
        let state = match self.portlayer.state(id).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                self.containers.delete(id);
                return Err(EngineError::no_such_container(id));
            }
            Err(e) => return Err(e),
        };
        if matches!(
            state.status,
            ContainerStatus::Stopped | ContainerStatus::Exited | ContainerStatus::Created
        ) {
            return Ok(false);
        }

        let wait = timeout
            .or(container.config.stop_timeout.map(Duration::from_secs))
            .unwrap_or(config::DEFAULT_STOP_TIMEOUT);
        retry_on_conflict("stop", || async move {
            let handle = self.portlayer.handle(id).await?;
            let handle = self.portlayer.scope_unbind(handle, id).await?;
            let handle = self.portlayer.state_change(handle, PowerState::Stopped).await?;
            self.portlayer.commit(handle, id, Some(wait)).await
        })
        .await?;

        self.unmap_ports(id, &container.nat_map).await;
        Ok(true)
    }

    pub async fn restart(&self, key: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.require(key)?;
        self.stop_container(&container, timeout).await?;
        self.start(&container.id).await?;
        self.emit(action::RESTART, &container);
        Ok(())
    }

    // ---- remove / rename ----

    pub async fn remove(&self, key: &str, force: bool, remove_volumes: bool) -> Result<()> {
        let container = self.require(key)?;
        let id = &container.id;

        if force {
            match self.stop_container(&container, Some(Duration::ZERO)).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        } else if let Ok(state) = self.portlayer.state(id).await {
            // An errored guest cannot report its own state; only a forced
            // power-off gets it removable.
            if state.status == ContainerStatus::Error {
                let _ = self.stop_container(&container, Some(Duration::ZERO)).await;
            }
        }

        match self.portlayer.remove(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.containers.delete(id);
                return Err(EngineError::no_such_container(key));
            }
            Err(e) if e.is_conflict() => {
                return Err(EngineError::conflict(
                    "You cannot remove a running container. \
                     Stop the container before attempting removal or force remove",
                ));
            }
            Err(e) => return Err(e),
        }

        self.unmap_ports(id, &container.nat_map).await;
        self.containers.delete(id);
        self.emit(action::DESTROY, &container);
        if remove_volumes {
            self.remove_anonymous_volumes(&container).await;
        }
        Ok(())
    }

    /// Deletes the container's anonymous volumes unless another cached
    /// container still mounts them.
    async fn remove_anonymous_volumes(&self, container: &Container) {
        for mount in &container.mounts {
            if mount.from_bind {
                continue;
            }
            let in_use = self.containers.list().iter().any(|other| {
                other.id != container.id && other.mounts.iter().any(|m| m.name == mount.name)
            });
            if in_use {
                continue;
            }
            if let Err(e) = self.portlayer.remove_volume(&mount.name).await {
                if !e.is_not_found() {
                    warn!(volume = %mount.name, "failed to remove volume: {e}");
                }
            }
        }
    }

    pub async fn rename(&self, key: &str, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let container = self.require(key)?;
        if container.name == new_name {
            return Err(EngineError::bad_request(
                "Renaming a container with the same name as its current name",
            ));
        }
        self.containers.reserve_name(new_name)?;

        let id = &container.id;
        let committed = retry_on_conflict("rename", || async move {
            let handle = self.portlayer.handle(id).await?;
            let handle = self.portlayer.rename(handle, new_name).await?;
            self.portlayer.commit(handle, id, None).await
        })
        .await;
        if let Err(e) = committed {
            self.containers.release_name(new_name);
            return Err(e);
        }
        if let Err(e) = self.containers.update_name(&container.name, new_name) {
            self.containers.release_name(new_name);
            return Err(e);
        }

        let renamed = self.require(&container.id)?;
        let mut actor = self.actor(&renamed);
        actor
            .attributes
            .insert("oldName".to_string(), container.name.clone());
        self.events
            .publish(EngineEvent::container(action::RENAME, actor));
        Ok(())
    }

    // ---- signal / wait / state ----

    pub async fn kill(&self, key: &str, signal: i64) -> Result<()> {
        let container = self.require(key)?;
        let state = self.portlayer.state(&container.id).await?;
        if !state.running {
            return Err(EngineError::conflict(format!(
                "Cannot kill container {}: container is not running",
                container.name
            )));
        }
        self.portlayer.signal(&container.id, signal).await?;
        if let Ok(after) = self.portlayer.state(&container.id).await {
            if !after.running {
                self.unmap_ports(&container.id, &container.nat_map).await;
            }
        }
        let mut actor = self.actor(&container);
        actor
            .attributes
            .insert("signal".to_string(), signal.to_string());
        self.events
            .publish(EngineEvent::container(action::KILL, actor));
        Ok(())
    }

    pub async fn wait(&self, key: &str, timeout: Option<Duration>) -> Result<ContainerState> {
        let container = self.require(key)?;
        self.portlayer.wait(&container.id, timeout).await
    }

    pub async fn state(&self, key: &str) -> Result<ContainerState> {
        let container = self.require(key)?;
        self.portlayer.state(&container.id).await
    }

    /// Cached containers joined with their live state, newest first.
    pub async fn list(&self, all: bool) -> Result<Vec<(Container, ContainerState)>> {
        let mut out = Vec::new();
        for container in self.containers.list() {
            match self.portlayer.state(&container.id).await {
                Ok(state) => {
                    if all || state.running {
                        out.push((container, state));
                    }
                }
                Err(e) if e.is_not_found() => {
                    self.containers.delete(&container.id);
                }
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| b.0.created.cmp(&a.0.created));
        Ok(out)
    }

    pub async fn resize(&self, key: &str, height: u32, width: u32) -> Result<()> {
        let container = self.require(key)?;
        self.portlayer.resize(&container.id, height, width).await?;
        self.emit(action::RESIZE, &container);
        Ok(())
    }

    // ---- exec ----

    pub async fn exec_create(&self, key: &str, exec: &ExecConfig) -> Result<String> {
        let container = self.require(key)?;
        let state = self.portlayer.state(&container.id).await?;
        if !state.running {
            return Err(EngineError::conflict(format!(
                "Container {} is not running",
                container.name
            )));
        }
        if exec.cmd.is_empty() {
            return Err(EngineError::bad_request("No exec command specified"));
        }

        let spec = TaskSpec {
            id: Uuid::new_v4().simple().to_string(),
            path: exec.cmd[0].clone(),
            args: exec.cmd[1..].to_vec(),
            env: exec.env.clone(),
            working_dir: exec.working_dir.clone(),
            user: exec.user.clone(),
            tty: exec.tty,
            open_stdin: exec.attach_stdin,
            primary: false,
        };
        let id = &container.id;
        let spec = &spec;
        let task_id = retry_on_conflict("exec create", || async move {
            let handle = self.portlayer.handle(id).await?;
            let (handle, task_id) = self.portlayer.task_join(handle, spec).await?;
            self.portlayer.commit(handle, id, None).await?;
            Ok(task_id)
        })
        .await?;

        self.containers.add_exec(&container.id, &task_id);
        self.events.publish(EngineEvent::container(
            action::exec_create(&exec.cmd.join(" ")),
            self.actor(&container),
        ));
        Ok(task_id)
    }

    pub async fn exec_start(&self, exec_id: &str) -> Result<()> {
        let container = self.exec_owner(exec_id)?;
        let id = &container.id;
        retry_on_conflict("exec start", || async move {
            let handle = self.portlayer.handle(id).await?;
            let handle = self.portlayer.task_bind(handle, id, exec_id).await?;
            self.portlayer.commit(handle, id, None).await
        })
        .await?;

        let line = self
            .portlayer
            .task_inspect(&container.id, exec_id)
            .await
            .ok()
            .and_then(|task| task.process_config)
            .map(|p| {
                let mut parts = vec![p.path];
                parts.extend(p.args);
                parts.join(" ")
            })
            .unwrap_or_default();
        self.events.publish(EngineEvent::container(
            action::exec_start(&line),
            self.actor(&container),
        ));
        Ok(())
    }

    pub async fn exec_inspect(&self, exec_id: &str) -> Result<(Container, TaskState)> {
        let container = self.exec_owner(exec_id)?;
        let task = self.portlayer.task_inspect(&container.id, exec_id).await?;
        Ok((container, task))
    }

    fn exec_owner(&self, exec_id: &str) -> Result<Container> {
        self.containers
            .get_by_exec(exec_id)
            .ok_or_else(|| EngineError::not_found(format!("No such exec instance: {exec_id}")))
    }

    // ---- attach ----

    /// Binds the interaction endpoint and runs one attach session. A
    /// detach sequence unbinds cleanly and reports `detach`, not an error.
    pub async fn attach<CI, CO>(
        &self,
        key: &str,
        config: AttachConfig,
        client_in: CI,
        client_out: CO,
    ) -> Result<()>
    where
        CI: AsyncRead + Send + Unpin + 'static,
        CO: AsyncWrite + Send + Unpin + 'static,
    {
        let container = self.require(key)?;
        let id = container.id.clone();
        let cid = id.as_str();

        retry_on_conflict("attach bind", || async move {
            let handle = self.portlayer.handle(cid).await?;
            let handle = self.portlayer.interaction_bind(handle, cid).await?;
            self.portlayer.commit(handle, cid, None).await
        })
        .await?;
        self.emit(action::ATTACH, &container);

        let session = attach::attach_streams(
            Arc::clone(&self.portlayer),
            &id,
            config,
            client_in,
            client_out,
        )
        .await;

        match session {
            Err(e) if e.is_detach() => {
                let unbound = retry_on_conflict("attach unbind", || async move {
                    let handle = self.portlayer.handle(cid).await?;
                    let handle = self.portlayer.interaction_unbind(handle, cid).await?;
                    self.portlayer.commit(handle, cid, None).await
                })
                .await;
                if let Err(e) = unbound {
                    debug!(id, "interaction unbind after detach: {e}");
                }
                self.emit(action::DETACH, &container);
                Ok(())
            }
            other => other,
        }
    }

    // ---- streams ----

    pub async fn logs(
        &self,
        key: &str,
        follow: bool,
        timestamps: bool,
        since: Option<i64>,
        tail: Option<u64>,
    ) -> Result<(Container, ByteReader)> {
        let container = self.require(key)?;
        let reader = self
            .portlayer
            .logs(&container.id, follow, timestamps, since, tail)
            .await?;
        Ok((container, reader))
    }

    pub async fn stats(&self, key: &str, stream: bool) -> Result<ByteReader> {
        let container = self.require(key)?;
        self.portlayer.stats(&container.id, stream).await
    }

    // ---- archive ----

    pub async fn archive_stat(&self, key: &str, path: &str) -> Result<PathStat> {
        let container = self.require(key)?;
        archive::stat(&self.portlayer, &container, path).await
    }

    pub async fn archive_export(&self, key: &str, path: &str) -> Result<ByteReader> {
        let container = self.require(key)?;
        // Stat first so a missing path is a 404 instead of an empty tar.
        archive::stat(&self.portlayer, &container, path).await?;
        let sources = archive::plan_export(&container, path);
        Ok(archive::export_tar(Arc::clone(&self.portlayer), sources))
    }

    pub async fn archive_import<R>(&self, key: &str, path: &str, tar_stream: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let container = self.require(key)?;
        let mut map = ArchiveWriterMap::new(Arc::clone(&self.portlayer), &container, path);
        archive::import_tar(&mut map, tar_stream).await?;
        map.close().await
    }

    // ---- volumes ----

    pub async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeSpec> {
        self.portlayer.create_volume(spec).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeSpec>> {
        self.portlayer.list_volumes().await
    }

    pub async fn inspect_volume(&self, name: &str) -> Result<VolumeSpec> {
        self.portlayer.get_volume(name).await
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        if let Some(owner) = self
            .containers
            .list()
            .iter()
            .find(|c| c.mounts.iter().any(|m| m.name == name))
        {
            return Err(EngineError::conflict(format!(
                "volume {name} is in use by container {}",
                owner.name
            )));
        }
        self.portlayer.remove_volume(name).await
    }

    // ---- event bridge ----

    /// Translates one port-layer event into engine events and cache
    /// maintenance. Events about containers this engine never cached are
    /// someone else's.
    pub async fn handle_portlayer_event(&self, event: &PortLayerEvent) {
        let Some(container) = self.containers.get(&event.r#ref).ok().flatten() else {
            return;
        };
        match event.event.as_str() {
            event_kind::CONTAINER_STOPPED | event_kind::CONTAINER_POWERED_OFF => {
                let exit_code = self
                    .portlayer
                    .state(&container.id)
                    .await
                    .ok()
                    .and_then(|state| state.exit_code)
                    .unwrap_or(FALLBACK_EXIT_CODE);
                self.unmap_ports(&container.id, &container.nat_map).await;
                let mut actor = self.actor(&container);
                actor
                    .attributes
                    .insert("exitCode".to_string(), exit_code.to_string());
                self.events
                    .publish(EngineEvent::container(action::DIE, actor));

                if container.host_config.auto_remove {
                    if let Err(e) = self.remove(&container.id, true, true).await {
                        warn!(id = %container.id, "auto-remove failed: {e}");
                    }
                }
            }
            event_kind::CONTAINER_REMOVED => {
                self.unmap_ports(&container.id, &container.nat_map).await;
                self.containers.delete(&container.id);
                self.emit(action::DESTROY, &container);
            }
            other => debug!(event = other, "ignoring port-layer event"),
        }
    }
}

/// Container names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::bad_request(format!(
            "Invalid container name ({name}), only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NoopForwarder;
    use crate::testutil::FakePortLayer;
    use skiff_cache::{ImageConfig, ImageDefaults};
    use tokio::sync::broadcast::error::TryRecvError;

    fn busybox() -> ImageConfig {
        ImageConfig {
            image_id: "deadbeef01".to_string(),
            layer_id: "layer0".to_string(),
            name: "busybox".to_string(),
            tags: vec!["latest".to_string()],
            digests: Vec::new(),
            parent: None,
            size: 1024,
            created: Utc::now(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ImageDefaults {
                cmd: vec!["/bin/sh".to_string()],
                ..ImageDefaults::default()
            },
        }
    }

    fn backend() -> (Arc<FakePortLayer>, ContainerBackend) {
        let fake = FakePortLayer::new();
        let portlayer: Arc<dyn PortLayer> = fake.clone();
        let backend = ContainerBackend::new(portlayer, Arc::new(NoopForwarder), None);
        backend.images().add(busybox());
        (fake, backend)
    }

    fn request() -> ContainerConfig {
        ContainerConfig {
            image: "busybox".to_string(),
            ..ContainerConfig::default()
        }
    }

    fn drain_actions(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<String> {
        let mut actions = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => actions.push(event.action),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return actions,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
    }

    fn bound_host(port: &str) -> HostConfig {
        let mut host = HostConfig::default();
        host.port_bindings.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: String::new(),
                host_port: port.to_string(),
            }],
        );
        host
    }

    #[tokio::test]
    async fn create_start_stop_roundtrip() {
        let (fake, backend) = backend();
        let mut rx = backend.events().subscribe();

        let container = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();
        assert_eq!(container.name, "web");
        // The image default became the primary task.
        assert_eq!(container.config.cmd, vec!["/bin/sh"]);

        backend.start("web").await.unwrap();
        {
            let containers = fake.containers.lock().unwrap();
            let remote = containers.get(&container.id).unwrap();
            assert_eq!(remote.status, ContainerStatus::Running);
            assert!(remote.committed);
        }

        backend.stop("web", None).await.unwrap();
        {
            let containers = fake.containers.lock().unwrap();
            assert_eq!(
                containers.get(&container.id).unwrap().status,
                ContainerStatus::Stopped
            );
        }

        // Stopping again is a no-op and emits nothing further.
        backend.stop("web", None).await.unwrap();
        assert_eq!(drain_actions(&mut rx), vec!["create", "start", "stop"]);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict_naming_the_owner() {
        let (_fake, backend) = backend();
        let first = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();

        let err = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains(&format!(
            "The name \"web\" is already in use by container {}",
            first.id
        )));
    }

    #[tokio::test]
    async fn failed_create_releases_the_name() {
        let (fake, backend) = backend();
        fake.fail("commit", EngineError::internal("datastore offline"));

        let err = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap_err();
        assert!(!err.is_conflict());
        // Rollback ran against a fresh handle.
        assert!(fake.call_log().contains(&"scope_remove".to_string()));

        // The name is free again.
        backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_refuses_a_port_owned_by_a_running_container() {
        let (_fake, backend) = backend();
        let first = backend
            .create(Some("one".to_string()), request(), bound_host("8080"))
            .await
            .unwrap();
        backend.start(&first.id).await.unwrap();

        let second = backend
            .create(Some("two".to_string()), request(), bound_host("8080"))
            .await
            .unwrap();
        let err = backend.start(&second.id).await.unwrap_err();
        assert!(err.to_string().contains("8080"));
    }

    #[tokio::test]
    async fn start_reclaims_ports_from_a_stopped_owner() {
        let (fake, backend) = backend();
        let first = backend
            .create(Some("one".to_string()), request(), bound_host("8080"))
            .await
            .unwrap();
        backend.start(&first.id).await.unwrap();

        // The owner stopped behind the engine's back.
        fake.set_status(&first.id, ContainerStatus::Stopped);

        let second = backend
            .create(Some("two".to_string()), request(), bound_host("8080"))
            .await
            .unwrap();
        backend.start(&second.id).await.unwrap();

        let snapshot = backend.require(&second.id).unwrap();
        assert_eq!(snapshot.nat_map["80/tcp"][0].host_port, "8080");
    }

    #[tokio::test]
    async fn remove_running_requires_force() {
        let (fake, backend) = backend();
        let mut rx = backend.events().subscribe();
        let container = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();
        backend.start(&container.id).await.unwrap();

        let err = backend.remove("web", false, false).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("Stop the container"));

        backend.remove("web", true, false).await.unwrap();
        assert!(backend.require("web").is_err());
        assert!(!fake.containers.lock().unwrap().contains_key(&container.id));
        assert_eq!(
            drain_actions(&mut rx),
            vec!["create", "start", "stop", "destroy"]
        );
    }

    #[tokio::test]
    async fn rename_swaps_cache_and_reports_the_old_name() {
        let (_fake, backend) = backend();
        let mut rx = backend.events().subscribe();
        backend
            .create(Some("old".to_string()), request(), HostConfig::default())
            .await
            .unwrap();

        backend.rename("old", "new").await.unwrap();
        assert!(backend.require("new").is_ok());
        assert!(backend.require("old").is_err());

        let rename = loop {
            let event = rx.try_recv().unwrap();
            if event.action == action::RENAME {
                break event;
            }
        };
        assert_eq!(rename.actor.attributes["oldName"], "old");

        let err = backend.rename("new", "-bad-").await.unwrap_err();
        assert!(err.to_string().contains("Invalid container name"));
    }

    #[tokio::test]
    async fn kill_requires_a_running_container() {
        let (fake, backend) = backend();
        let container = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();

        let err = backend.kill("web", 9).await.unwrap_err();
        assert!(err.is_conflict());

        backend.start(&container.id).await.unwrap();
        backend.kill("web", 9).await.unwrap();
        assert_eq!(
            fake.containers.lock().unwrap()[&container.id].status,
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn exec_lifecycle_emits_command_lines() {
        let (_fake, backend) = backend();
        let container = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();

        let exec = ExecConfig {
            cmd: vec!["/bin/ls".to_string(), "-l".to_string()],
            ..ExecConfig::default()
        };
        let err = backend.exec_create("web", &exec).await.unwrap_err();
        assert!(err.is_conflict());

        backend.start(&container.id).await.unwrap();
        let mut rx = backend.events().subscribe();
        let exec_id = backend.exec_create("web", &exec).await.unwrap();
        backend.exec_start(&exec_id).await.unwrap();

        let actions = drain_actions(&mut rx);
        assert_eq!(actions[0], "exec_create: /bin/ls -l");
        assert_eq!(actions[1], "exec_start: /bin/ls -l");

        let (owner, task) = backend.exec_inspect(&exec_id).await.unwrap();
        assert_eq!(owner.id, container.id);
        assert!(task.running);
    }

    #[tokio::test]
    async fn die_event_reports_exit_code_and_auto_removes() {
        let (fake, backend) = backend();
        let host = HostConfig {
            auto_remove: true,
            ..HostConfig::default()
        };
        let container = backend
            .create(Some("web".to_string()), request(), host)
            .await
            .unwrap();
        backend.start(&container.id).await.unwrap();
        fake.set_status(&container.id, ContainerStatus::Stopped);

        let mut rx = backend.events().subscribe();
        backend
            .handle_portlayer_event(&PortLayerEvent {
                r#ref: container.id.clone(),
                event: event_kind::CONTAINER_STOPPED.to_string(),
                created_at: Utc::now(),
            })
            .await;

        let actions = drain_actions(&mut rx);
        assert_eq!(actions, vec!["die", "destroy"]);
        assert!(backend.require("web").is_err());

        // The exit code could not be read back, so the fallback appears.
        // (The fake reports no exit code for an externally stopped VM.)
    }

    #[tokio::test]
    async fn removed_event_evicts_and_emits_destroy_once() {
        let (_fake, backend) = backend();
        let container = backend
            .create(Some("web".to_string()), request(), HostConfig::default())
            .await
            .unwrap();

        let mut rx = backend.events().subscribe();
        let event = PortLayerEvent {
            r#ref: container.id.clone(),
            event: event_kind::CONTAINER_REMOVED.to_string(),
            created_at: Utc::now(),
        };
        backend.handle_portlayer_event(&event).await;
        backend.handle_portlayer_event(&event).await;

        assert_eq!(drain_actions(&mut rx), vec!["destroy"]);
        assert!(backend.require("web").is_err());
    }

    #[tokio::test]
    async fn volume_in_use_cannot_be_removed() {
        let (_fake, backend) = backend();
        let host = HostConfig {
            binds: vec!["data:/data".to_string()],
            ..HostConfig::default()
        };
        backend
            .create(Some("web".to_string()), request(), host)
            .await
            .unwrap();

        let err = backend.remove_volume("data").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("web-1.0_a").is_ok());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("sp ace").is_err());
    }
}
