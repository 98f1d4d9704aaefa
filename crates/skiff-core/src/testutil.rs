//! In-memory port layer backing the engine's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use skiff_error::{EngineError, Result};
use skiff_portlayer::models::{
    ContainerCreateSpec, ContainerInfo, ContainerState, ContainerStatus, Handle, PathStat,
    PowerState, ScopeInfo, ScopeJoinSpec, TaskSpec, TaskState, VolumeJoinSpec, VolumeSpec,
};
use skiff_portlayer::stream::{ByteReader, ByteWriter};
use skiff_portlayer::{KvStore, PortLayer};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::container::{Container, ContainerConfig, HostConfig, MountPoint};

/// Server-side view of one container held by [`FakePortLayer`].
pub struct FakeContainer {
    pub name: String,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub tasks: Vec<TaskSpec>,
    pub bound_tasks: Vec<String>,
    pub scopes: Vec<String>,
    pub volumes: Vec<VolumeJoinSpec>,
    pub committed: bool,
}

impl Default for FakeContainer {
    fn default() -> Self {
        Self {
            name: String::new(),
            status: ContainerStatus::Created,
            exit_code: None,
            tasks: Vec::new(),
            bound_tasks: Vec::new(),
            scopes: Vec::new(),
            volumes: Vec::new(),
            committed: false,
        }
    }
}

/// Scriptable in-memory [`PortLayer`].
///
/// Handles carry the container id so mutations can find their target;
/// state changes stay pending until commit, mirroring the remote contract.
/// Queue errors with [`FakePortLayer::fail`] to script failure paths.
#[derive(Default)]
pub struct FakePortLayer {
    seq: AtomicU64,
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pending_state: Mutex<HashMap<String, PowerState>>,
    pending_name: Mutex<HashMap<String, String>>,
    pub volumes: Mutex<HashMap<String, VolumeSpec>>,
    pub kv: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Vec<EngineError>>>,
    /// Bytes served by `export_archive`, keyed by device.
    pub exports: Mutex<HashMap<String, Vec<u8>>>,
    /// `(filter_spec, bytes)` accepted by `import_archive`, keyed by device.
    pub imports: Arc<Mutex<HashMap<String, (String, Vec<u8>)>>>,
    pub stdout: Mutex<HashMap<String, Vec<u8>>>,
    pub stderr: Mutex<HashMap<String, Vec<u8>>>,
    pub stdin_sink: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    /// NDJSON payload served by `event_stream`.
    pub events: Mutex<Vec<u8>>,
}

impl FakePortLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues an error for the next call to `method`.
    pub fn fail(&self, method: &str, err: EngineError) {
        self.failures
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push(err);
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.status = status;
        }
    }

    fn record(&self, method: &str) -> Result<()> {
        self.calls.lock().unwrap().push(method.to_string());
        let mut failures = self.failures.lock().unwrap();
        if let Some(queue) = failures.get_mut(method) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        Ok(())
    }

    fn next_handle(&self, id: &str) -> Handle {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        Handle::new(format!("{id}#{n}"))
    }

    fn handle_id(handle: &Handle) -> String {
        handle
            .as_str()
            .split('#')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn snapshot(&self, id: &str) -> Result<ContainerState> {
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("container {id}")))?;
        Ok(ContainerState {
            status: c.status,
            running: c.status == ContainerStatus::Running,
            exit_code: c.exit_code,
            started_at: None,
            finished_at: None,
        })
    }

    fn reader_for(bytes: Vec<u8>) -> ByteReader {
        Box::new(std::io::Cursor::new(bytes))
    }
}

#[async_trait]
impl KvStore for FakePortLayer {
    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.record("kv_get")?;
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        self.record("kv_put")?;
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl PortLayer for FakePortLayer {
    async fn ping(&self) -> Result<()> {
        self.record("ping")
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<(String, Handle)> {
        self.record("create_container")?;
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("cid{n:04}");
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                ..FakeContainer::default()
            },
        );
        let handle = self.next_handle(&id);
        Ok((id, handle))
    }

    async fn handle(&self, id: &str) -> Result<Handle> {
        self.record("handle")?;
        if !self.containers.lock().unwrap().contains_key(id) {
            return Err(EngineError::not_found(format!("container {id}")));
        }
        Ok(self.next_handle(id))
    }

    async fn commit(&self, handle: Handle, id: &str, _wait: Option<Duration>) -> Result<()> {
        self.record("commit")?;
        debug_assert_eq!(Self::handle_id(&handle), id);
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("container {id}")))?;
        if let Some(state) = self.pending_state.lock().unwrap().remove(id) {
            c.status = match state {
                PowerState::Running => ContainerStatus::Running,
                PowerState::Stopped => ContainerStatus::Stopped,
            };
        }
        if let Some(name) = self.pending_name.lock().unwrap().remove(id) {
            c.name = name;
        }
        c.committed = true;
        Ok(())
    }

    async fn state_change(&self, handle: Handle, state: PowerState) -> Result<Handle> {
        self.record("state_change")?;
        let id = Self::handle_id(&handle);
        self.pending_state.lock().unwrap().insert(id.clone(), state);
        Ok(self.next_handle(&id))
    }

    async fn rename(&self, handle: Handle, name: &str) -> Result<Handle> {
        self.record("rename")?;
        let id = Self::handle_id(&handle);
        self.pending_name
            .lock()
            .unwrap()
            .insert(id.clone(), name.to_string());
        Ok(self.next_handle(&id))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record("remove")?;
        let mut containers = self.containers.lock().unwrap();
        match containers.get(id) {
            None => Err(EngineError::not_found(format!("container {id}"))),
            Some(c) if c.status == ContainerStatus::Running => {
                Err(EngineError::conflict(format!("container {id} is powered on")))
            }
            Some(_) => {
                containers.remove(id);
                Ok(())
            }
        }
    }

    async fn signal(&self, id: &str, signal: i64) -> Result<()> {
        self.record("signal")?;
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("container {id}")))?;
        if signal == 0 || signal == 9 {
            c.status = ContainerStatus::Stopped;
            c.exit_code = Some(137);
        }
        Ok(())
    }

    async fn wait(&self, id: &str, _timeout: Option<Duration>) -> Result<ContainerState> {
        self.record("wait")?;
        self.snapshot(id)
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        self.record("state")?;
        self.snapshot(id)
    }

    async fn info(&self, id: &str) -> Result<ContainerInfo> {
        self.record("info")?;
        let state = self.snapshot(id)?;
        let containers = self.containers.lock().unwrap();
        let c = containers.get(id).unwrap();
        Ok(ContainerInfo {
            id: id.to_string(),
            name: c.name.clone(),
            image_id: String::new(),
            layer_id: String::new(),
            state,
            created: Utc::now(),
            command: Vec::new(),
            volumes: c.volumes.clone(),
        })
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        self.record("list")?;
        let ids: Vec<String> = {
            let containers = self.containers.lock().unwrap();
            containers
                .iter()
                .filter(|(_, c)| all || c.status == ContainerStatus::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut infos = Vec::new();
        for id in ids {
            infos.push(self.info(&id).await?);
        }
        Ok(infos)
    }

    async fn logs(
        &self,
        id: &str,
        _follow: bool,
        _timestamps: bool,
        _since: Option<i64>,
        _tail: Option<u64>,
    ) -> Result<ByteReader> {
        self.record("logs")?;
        let bytes = self
            .stdout
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(Self::reader_for(bytes))
    }

    async fn stats(&self, id: &str, _stream: bool) -> Result<ByteReader> {
        self.record("stats")?;
        let _ = self.snapshot(id)?;
        Ok(Self::reader_for(b"{}\n".to_vec()))
    }

    async fn task_join(&self, handle: Handle, spec: &TaskSpec) -> Result<(Handle, String)> {
        self.record("task_join")?;
        let id = Self::handle_id(&handle);
        let task_id = if spec.id.is_empty() {
            format!("task{}", self.seq.fetch_add(1, Ordering::SeqCst))
        } else {
            spec.id.clone()
        };
        let mut stored = spec.clone();
        stored.id = task_id.clone();
        if let Some(c) = self.containers.lock().unwrap().get_mut(&id) {
            c.tasks.push(stored);
        }
        Ok((self.next_handle(&id), task_id))
    }

    async fn task_bind(&self, handle: Handle, id: &str, task_id: &str) -> Result<Handle> {
        self.record("task_bind")?;
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.bound_tasks.push(task_id.to_string());
        }
        let _ = handle;
        Ok(self.next_handle(id))
    }

    async fn task_inspect(&self, id: &str, task_id: &str) -> Result<TaskState> {
        self.record("task_inspect")?;
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("container {id}")))?;
        let spec = c
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("task {task_id}")))?;
        Ok(TaskState {
            id: task_id.to_string(),
            running: c.bound_tasks.iter().any(|t| t == task_id)
                && c.status == ContainerStatus::Running,
            exit_code: None,
            process_config: Some(spec),
        })
    }

    async fn interaction_join(&self, handle: Handle) -> Result<Handle> {
        self.record("interaction_join")?;
        let id = Self::handle_id(&handle);
        Ok(self.next_handle(&id))
    }

    async fn interaction_bind(&self, handle: Handle, id: &str) -> Result<Handle> {
        self.record("interaction_bind")?;
        let _ = handle;
        Ok(self.next_handle(id))
    }

    async fn interaction_unbind(&self, handle: Handle, id: &str) -> Result<Handle> {
        self.record("interaction_unbind")?;
        let _ = handle;
        Ok(self.next_handle(id))
    }

    async fn stdin_writer(&self, id: &str, _deadline: Duration) -> Result<ByteWriter> {
        self.record("stdin_writer")?;
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let sink = Arc::clone(&self.stdin_sink);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = server.read_to_end(&mut buf).await;
            sink.lock().unwrap().entry(id).or_default().extend(buf);
        });
        Ok(Box::new(client))
    }

    async fn close_stdin(&self, _id: &str) -> Result<()> {
        self.record("close_stdin")
    }

    async fn stdout_reader(&self, id: &str, _deadline: Duration) -> Result<ByteReader> {
        self.record("stdout_reader")?;
        let bytes = self
            .stdout
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(Self::reader_for(bytes))
    }

    async fn stderr_reader(&self, id: &str, _deadline: Duration) -> Result<ByteReader> {
        self.record("stderr_reader")?;
        let bytes = self
            .stderr
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(Self::reader_for(bytes))
    }

    async fn resize(&self, _id: &str, _height: u32, _width: u32) -> Result<()> {
        self.record("resize")
    }

    async fn logging_join(&self, handle: Handle) -> Result<Handle> {
        self.record("logging_join")?;
        let id = Self::handle_id(&handle);
        Ok(self.next_handle(&id))
    }

    async fn scope_add(&self, handle: Handle, spec: &ScopeJoinSpec) -> Result<Handle> {
        self.record("scope_add")?;
        let id = Self::handle_id(&handle);
        if let Some(c) = self.containers.lock().unwrap().get_mut(&id) {
            c.scopes.push(spec.scope.clone());
        }
        Ok(self.next_handle(&id))
    }

    async fn scope_remove(&self, handle: Handle, id: &str) -> Result<Handle> {
        self.record("scope_remove")?;
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.scopes.clear();
        }
        let _ = handle;
        Ok(self.next_handle(id))
    }

    async fn scope_bind(&self, handle: Handle, id: &str) -> Result<Handle> {
        self.record("scope_bind")?;
        let _ = handle;
        Ok(self.next_handle(id))
    }

    async fn scope_unbind(&self, handle: Handle, id: &str) -> Result<Handle> {
        self.record("scope_unbind")?;
        let _ = handle;
        Ok(self.next_handle(id))
    }

    async fn scope_list(&self, name: Option<&str>) -> Result<Vec<ScopeInfo>> {
        self.record("scope_list")?;
        let bridge = ScopeInfo {
            name: "bridge".to_string(),
            scope_type: "bridge".to_string(),
            subnet: None,
            gateway: None,
        };
        match name {
            Some(n) if n != "bridge" => Ok(Vec::new()),
            _ => Ok(vec![bridge]),
        }
    }

    async fn scope_create(&self, spec: &ScopeInfo) -> Result<ScopeInfo> {
        self.record("scope_create")?;
        Ok(spec.clone())
    }

    async fn scope_delete(&self, _name: &str) -> Result<()> {
        self.record("scope_delete")
    }

    async fn create_image_store(&self, _name: &str) -> Result<()> {
        self.record("create_image_store")
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeSpec> {
        self.record("create_volume")?;
        let mut volumes = self.volumes.lock().unwrap();
        if volumes.contains_key(&spec.name) {
            return Err(EngineError::conflict(format!(
                "volume {} already exists",
                spec.name
            )));
        }
        volumes.insert(spec.name.clone(), spec.clone());
        Ok(spec.clone())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record("remove_volume")?;
        self.volumes
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found(format!("volume {name}")))
    }

    async fn volume_join(&self, handle: Handle, spec: &VolumeJoinSpec) -> Result<Handle> {
        self.record("volume_join")?;
        let id = Self::handle_id(&handle);
        if let Some(c) = self.containers.lock().unwrap().get_mut(&id) {
            c.volumes.push(spec.clone());
        }
        Ok(self.next_handle(&id))
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSpec>> {
        self.record("list_volumes")?;
        Ok(self.volumes.lock().unwrap().values().cloned().collect())
    }

    async fn get_volume(&self, name: &str) -> Result<VolumeSpec> {
        self.record("get_volume")?;
        self.volumes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("volume {name}")))
    }

    async fn stat_path(&self, _store: &str, _device: &str, filter_spec: &str) -> Result<PathStat> {
        self.record("stat_path")?;
        let _ = filter_spec;
        Ok(PathStat {
            name: "file".to_string(),
            mode: 0o644,
            size: 42,
            mtime: Utc::now(),
            link_target: String::new(),
        })
    }

    async fn export_archive(
        &self,
        _store: &str,
        device: &str,
        _data: bool,
        _filter_spec: &str,
    ) -> Result<ByteReader> {
        self.record("export_archive")?;
        let bytes = self
            .exports
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("device {device}")))?;
        Ok(Self::reader_for(bytes))
    }

    async fn import_archive(
        &self,
        _store: &str,
        device: &str,
        filter_spec: &str,
    ) -> Result<(ByteWriter, JoinHandle<Result<()>>)> {
        self.record("import_archive")?;
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let imports = Arc::clone(&self.imports);
        let device = device.to_string();
        let filter = filter_spec.to_string();
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            server
                .read_to_end(&mut buf)
                .await
                .map_err(EngineError::from)?;
            imports.lock().unwrap().insert(device, (filter, buf));
            Ok(())
        });
        Ok((Box::new(client), task))
    }

    async fn event_stream(&self) -> Result<ByteReader> {
        self.record("event_stream")?;
        let bytes = self.events.lock().unwrap().clone();
        Ok(Self::reader_for(bytes))
    }
}

/// Builds a cached container with the given mounts (`(name, destination)`
/// pairs) for archive and lifecycle tests.
pub fn test_container(id: &str, name: &str, mounts: &[(&str, &str)]) -> Container {
    Container {
        id: id.to_string(),
        name: name.to_string(),
        image_id: "sha256:feed".to_string(),
        layer_id: "layer0".to_string(),
        config: ContainerConfig {
            image: "busybox".to_string(),
            cmd: vec!["/bin/sh".to_string()],
            ..ContainerConfig::default()
        },
        host_config: HostConfig::default(),
        mounts: mounts
            .iter()
            .map(|(volume, destination)| MountPoint {
                name: (*volume).to_string(),
                destination: (*destination).to_string(),
                flags: "rw".to_string(),
                from_bind: true,
            })
            .collect(),
        nat_map: HashMap::new(),
        created: Utc::now(),
    }
}
