//! Wire models exchanged with the port layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque token representing an in-flight modification to a container.
///
/// Every mutating call consumes a handle and returns a new one; committing a
/// handle publishes the pending changes atomically. Handles are plain tokens,
/// never shared and never reused after being consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Power state requested through `StateChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    Running,
    Stopped,
}

/// Container status as reported by the port layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Exited,
    Error,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Live state snapshot for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Creation parameters for a new container handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image_id: String,
    pub layer_id: String,
    pub repo_name: String,
    pub memory_mb: i64,
    pub cpu_count: i32,
    #[serde(default)]
    pub stop_signal: Option<String>,
}

/// Parameters for joining a task (primary or exec) to a handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    /// True for the container's primary task, false for exec sessions.
    pub primary: bool,
}

/// Result of inspecting a task on a handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub process_config: Option<TaskSpec>,
}

/// Scope (network) membership parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeJoinSpec {
    pub scope: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// A scope known to the port layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub name: String,
    pub scope_type: String,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Volume description used for create and list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: String,
    pub store: String,
    /// Requested capacity in MB; negative means "store default".
    pub capacity_mb: i64,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
}

/// Mount parameters for joining a volume to a container handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeJoinSpec {
    pub volume: String,
    pub mount_path: String,
    pub flags: String,
}

/// Stat result for a path inside a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PathStat {
    pub name: String,
    pub mode: u32,
    pub size: i64,
    pub mtime: DateTime<Utc>,
    #[serde(default)]
    pub link_target: String,
}

/// Container summary returned by info/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub layer_id: String,
    pub state: ContainerState,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeJoinSpec>,
}

/// Event kinds published by the port layer that the bridge understands.
pub mod event_kind {
    pub const CONTAINER_STOPPED: &str = "ContainerStopped";
    pub const CONTAINER_POWERED_OFF: &str = "ContainerPoweredOff";
    pub const CONTAINER_REMOVED: &str = "ContainerRemoved";
}

/// One event from the port-layer event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortLayerEvent {
    /// Container id the event refers to.
    pub r#ref: String,
    pub event: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&PowerState::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(
            serde_json::to_string(&PowerState::Stopped).unwrap(),
            "\"STOPPED\""
        );
    }

    #[test]
    fn container_status_roundtrips_lowercase() {
        let s: ContainerStatus = serde_json::from_str("\"exited\"").unwrap();
        assert_eq!(s, ContainerStatus::Exited);
        assert_eq!(s.to_string(), "exited");
    }

    #[test]
    fn event_decodes_pascal_case() {
        let json = r#"{"Ref":"abc123","Event":"ContainerStopped","CreatedAt":"2024-05-01T12:00:00Z"}"#;
        let event: PortLayerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.r#ref, "abc123");
        assert_eq!(event.event, event_kind::CONTAINER_STOPPED);
    }
}
