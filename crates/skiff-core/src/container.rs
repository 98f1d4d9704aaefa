//! Engine-side container model cached by the personality.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use skiff_cache::CacheEntry;

/// One host-side binding for a container port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    /// Empty means "allocate an ephemeral host port at start".
    pub host_port: String,
}

/// Container-port (`"80/tcp"`) to host bindings.
pub type PortMap = HashMap<String, Vec<PortBinding>>;

/// Requested creation config, merged with image defaults at create time.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    /// Anonymous volume destinations (request plus image-declared).
    pub volumes: BTreeSet<String>,
    pub exposed_ports: BTreeSet<String>,
    pub labels: HashMap<String, String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u64>,
}

/// Restart policy. Stored and surfaced by inspect; never acted upon.
#[derive(Debug, Clone, Default)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: u32,
}

/// Host-side policy fixed at create time.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub memory_mb: i64,
    pub cpu_count: i64,
    /// Explicit volume mounts in `name:dst[:flags]` form.
    pub binds: Vec<String>,
    pub port_bindings: PortMap,
    pub auto_remove: bool,
    pub network_mode: String,
    pub restart_policy: RestartPolicy,
}

/// A volume attached at a path inside the container filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub name: String,
    pub destination: String,
    pub flags: String,
    /// True when the mount came from an explicit host-config bind.
    pub from_bind: bool,
}

/// Cached container metadata. Callers treat instances as immutable
/// snapshots; all mutation happens through the cache.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub layer_id: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    /// Resolved mounts: parsed binds plus anonymous volumes.
    pub mounts: Vec<MountPoint>,
    /// Port-binding snapshot taken when ports are actually mapped.
    pub nat_map: PortMap,
    pub created: DateTime<Utc>,
}

impl Container {
    /// The primary task's command line, `<path> <args>` style, used in
    /// exec and process event strings.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = self.config.entrypoint.clone();
        parts.extend(self.config.cmd.iter().cloned());
        parts.join(" ")
    }
}

impl CacheEntry for Container {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}
