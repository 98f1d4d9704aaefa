//! The remote operation surface consumed by the personality.

use std::time::Duration;

use async_trait::async_trait;
use skiff_error::Result;
use tokio::task::JoinHandle;

use crate::models::{
    ContainerCreateSpec, ContainerInfo, ContainerState, Handle, PathStat, PowerState,
    ScopeInfo, ScopeJoinSpec, TaskSpec, TaskState, VolumeJoinSpec, VolumeSpec,
};
use crate::stream::{ByteReader, ByteWriter};

/// Key-value persistence owned by the port layer.
///
/// Split out of [`PortLayer`] so state that only needs persistence (the image
/// cache) can be tested against an in-memory map.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a value; absent keys return `Ok(None)`.
    async fn kv_get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a value, creating or replacing the key.
    async fn kv_put(&self, key: &str, value: &str) -> Result<()>;
}

/// Typed access to every port-layer operation family.
///
/// Handle-consuming mutations take a [`Handle`] by value and return the
/// successor handle; the orchestrator threads them linearly and commits at
/// the end. All errors have already been folded into the engine taxonomy.
#[async_trait]
pub trait PortLayer: KvStore {
    // ---- misc ----

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    // ---- containers ----

    /// Creates a new container, returning its id and the initial handle.
    /// Fails not-found when the image is unknown to the port layer.
    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<(String, Handle)>;

    /// Opens a fresh handle on an existing container.
    async fn handle(&self, id: &str) -> Result<Handle>;

    /// Commits pending mutations. `wait` bounds the blocking portion; used
    /// by stop to forward the grace period.
    async fn commit(&self, handle: Handle, id: &str, wait: Option<Duration>) -> Result<()>;

    /// Requests a power-state transition on the handle.
    async fn state_change(&self, handle: Handle, state: PowerState) -> Result<Handle>;

    /// Renames the container on the handle.
    async fn rename(&self, handle: Handle, name: &str) -> Result<Handle>;

    /// Removes a committed container.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Delivers a signal; signal 0 is translated to SIGKILL remotely.
    async fn signal(&self, id: &str, signal: i64) -> Result<()>;

    /// Blocks until the container exits or the timeout elapses. `None`
    /// waits indefinitely.
    async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<ContainerState>;

    /// Returns the live state snapshot.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// Returns full info for one container.
    async fn info(&self, id: &str) -> Result<ContainerInfo>;

    /// Lists containers known to the port layer.
    async fn list(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    /// Opens the log stream. EOF on the wire is normal termination.
    async fn logs(
        &self,
        id: &str,
        follow: bool,
        timestamps: bool,
        since: Option<i64>,
        tail: Option<u64>,
    ) -> Result<ByteReader>;

    /// Opens the stats stream.
    async fn stats(&self, id: &str, stream: bool) -> Result<ByteReader>;

    // ---- tasks ----

    /// Joins a task (primary or exec) to the handle. Returns the successor
    /// handle and the task id.
    async fn task_join(&self, handle: Handle, spec: &TaskSpec) -> Result<(Handle, String)>;

    /// Binds a joined task so it runs when the container enters RUNNING.
    async fn task_bind(&self, handle: Handle, id: &str, task_id: &str) -> Result<Handle>;

    /// Inspects a task's state on a committed container.
    async fn task_inspect(&self, id: &str, task_id: &str) -> Result<TaskState>;

    // ---- interaction ----

    /// Enables the interaction capability on the handle.
    async fn interaction_join(&self, handle: Handle) -> Result<Handle>;

    /// Binds the interaction endpoint for attach.
    async fn interaction_bind(&self, handle: Handle, id: &str) -> Result<Handle>;

    /// Unbinds the interaction endpoint; the detach path commits this.
    async fn interaction_unbind(&self, handle: Handle, id: &str) -> Result<Handle>;

    /// Opens the stdin writer for an attached container.
    async fn stdin_writer(&self, id: &str, deadline: Duration) -> Result<ByteWriter>;

    /// Signals end-of-input on stdin.
    async fn close_stdin(&self, id: &str) -> Result<()>;

    /// Opens the stdout stream with a remote-side deadline.
    async fn stdout_reader(&self, id: &str, deadline: Duration) -> Result<ByteReader>;

    /// Opens the stderr stream with a remote-side deadline.
    async fn stderr_reader(&self, id: &str, deadline: Duration) -> Result<ByteReader>;

    /// Resizes the pty.
    async fn resize(&self, id: &str, height: u32, width: u32) -> Result<()>;

    // ---- logging ----

    /// Enables the log-streaming capability on the handle.
    async fn logging_join(&self, handle: Handle) -> Result<Handle>;

    // ---- scopes ----

    /// Joins the container to a network scope.
    async fn scope_add(&self, handle: Handle, spec: &ScopeJoinSpec) -> Result<Handle>;

    /// Inverse of `scope_add`; registered as the rollback for create.
    async fn scope_remove(&self, handle: Handle, id: &str) -> Result<Handle>;

    /// Activates scope membership during start.
    async fn scope_bind(&self, handle: Handle, id: &str) -> Result<Handle>;

    /// Deactivates scope membership during stop.
    async fn scope_unbind(&self, handle: Handle, id: &str) -> Result<Handle>;

    /// Lists scopes, optionally filtered by name.
    async fn scope_list(&self, name: Option<&str>) -> Result<Vec<ScopeInfo>>;

    /// Creates a scope.
    async fn scope_create(&self, spec: &ScopeInfo) -> Result<ScopeInfo>;

    /// Deletes a scope.
    async fn scope_delete(&self, name: &str) -> Result<()>;

    // ---- storage ----

    /// Creates the image store; callers ignore conflict.
    async fn create_image_store(&self, name: &str) -> Result<()>;

    /// Creates a volume.
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeSpec>;

    /// Removes a volume by name.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Joins a volume to the container handle at its mount path.
    async fn volume_join(&self, handle: Handle, spec: &VolumeJoinSpec) -> Result<Handle>;

    /// Lists volumes.
    async fn list_volumes(&self) -> Result<Vec<VolumeSpec>>;

    /// Fetches one volume.
    async fn get_volume(&self, name: &str) -> Result<VolumeSpec>;

    /// Stats a path inside a device, scoped by a base64 filter spec.
    async fn stat_path(&self, store: &str, device: &str, filter_spec: &str) -> Result<PathStat>;

    /// Opens a tar export stream for a device subtree.
    async fn export_archive(
        &self,
        store: &str,
        device: &str,
        data: bool,
        filter_spec: &str,
    ) -> Result<ByteReader>;

    /// Opens a tar import stream for a device. The returned join handle
    /// resolves with the RPC outcome once the writer is shut down.
    async fn import_archive(
        &self,
        store: &str,
        device: &str,
        filter_spec: &str,
    ) -> Result<(ByteWriter, JoinHandle<Result<()>>)>;

    // ---- events ----

    /// Opens the long-poll event stream.
    async fn event_stream(&self) -> Result<ByteReader>;
}
