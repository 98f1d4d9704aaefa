//! Engine event model and the in-process event bus.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::trace;

/// Event action strings, verbatim on the wire.
pub mod action {
    pub const CREATE: &str = "create";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const RESTART: &str = "restart";
    pub const KILL: &str = "kill";
    pub const RESIZE: &str = "resize";
    pub const ATTACH: &str = "attach";
    pub const DETACH: &str = "detach";
    pub const DIE: &str = "die";
    pub const DESTROY: &str = "destroy";
    pub const RENAME: &str = "Rename";

    /// `exec_create: <path> <args>`
    #[must_use]
    pub fn exec_create(command_line: &str) -> String {
        format!("exec_create: {command_line}")
    }

    /// `exec_start: <path> <args>`
    #[must_use]
    pub fn exec_start(command_line: &str) -> String {
        format!("exec_start: {command_line}")
    }
}

/// Who an event is about.
#[derive(Debug, Clone)]
pub struct EventActor {
    pub id: String,
    pub attributes: HashMap<String, String>,
}

/// One engine event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub action: String,
    /// `container` for everything the bridge emits; `image` for pushes.
    pub event_type: String,
    pub actor: EventActor,
    pub time: i64,
    pub time_nano: i64,
}

impl EngineEvent {
    #[must_use]
    pub fn container(action: impl Into<String>, actor: EventActor) -> Self {
        let now = Utc::now();
        Self {
            action: action.into(),
            event_type: "container".to_string(),
            actor,
            time: now.timestamp(),
            time_nano: now.timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast fan-out for engine events.
///
/// Publishing never blocks; slow subscribers observe lag through the
/// broadcast channel and can resubscribe.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        trace!(action = %event.action, id = %event.actor.id, "publish event");
        // No subscribers is fine; the send error only means that.
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
