//! Host-port ownership and the forwarding seam.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;
use skiff_error::{EngineError, Result};
use tracing::debug;

/// Programs host-side forwarding rules. The real implementation lives with
/// the host networking stack; the engine only drives it through this seam.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Inserts the DNAT and interbridge rules for one exposed port. The
    /// implementation resolves the container's address itself.
    async fn map(
        &self,
        host_port: u16,
        container_id: &str,
        container_port: u16,
        proto: &str,
    ) -> Result<()>;

    /// Removes the rules for one host port.
    async fn unmap(&self, host_port: u16, proto: &str) -> Result<()>;
}

/// Forwarder that records nothing. Used when the deployment handles NAT
/// outside the personality, and in tests.
#[derive(Default)]
pub struct NoopForwarder;

#[async_trait]
impl PortForwarder for NoopForwarder {
    async fn map(
        &self,
        host_port: u16,
        container_id: &str,
        container_port: u16,
        proto: &str,
    ) -> Result<()> {
        debug!(host_port, container_id, container_port, proto, "map port");
        Ok(())
    }

    async fn unmap(&self, host_port: u16, proto: &str) -> Result<()> {
        debug!(host_port, proto, "unmap port");
        Ok(())
    }
}

/// Process-wide `hostPort -> containerId` map.
///
/// Rebuilt only from live operations; the port layer stays the source of
/// truth across restarts.
#[derive(Default)]
pub struct PortOwnership {
    map: Mutex<HashMap<u16, String>>,
}

impl PortOwnership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of a host port.
    pub fn owner(&self, port: u16) -> Option<String> {
        self.map.lock().expect("port map lock poisoned").get(&port).cloned()
    }

    /// Claims a host port for a container. Fails if a different container
    /// already owns it.
    pub fn claim(&self, port: u16, container_id: &str) -> Result<()> {
        let mut map = self.map.lock().expect("port map lock poisoned");
        if let Some(owner) = map.get(&port) {
            if owner != container_id {
                return Err(EngineError::internal(format!(
                    "host port {port} is already in use by container {owner}"
                )));
            }
        }
        map.insert(port, container_id.to_string());
        Ok(())
    }

    /// Releases one host port.
    pub fn release(&self, port: u16) {
        self.map.lock().expect("port map lock poisoned").remove(&port);
    }

    /// Releases every port owned by a container and returns them.
    pub fn release_all(&self, container_id: &str) -> Vec<u16> {
        let mut map = self.map.lock().expect("port map lock poisoned");
        let ports: Vec<u16> = map
            .iter()
            .filter(|(_, owner)| owner.as_str() == container_id)
            .map(|(port, _)| *port)
            .collect();
        for port in &ports {
            map.remove(port);
        }
        ports
    }

    /// Picks a free ephemeral host port for a binding that did not name one.
    pub fn allocate_ephemeral(&self) -> Result<u16> {
        let map = self.map.lock().expect("port map lock poisoned");
        let mut rng = rand::thread_rng();
        for _ in 0..128 {
            let candidate: u16 = rng.gen_range(32768..61000);
            if !map.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(EngineError::internal("no free ephemeral host ports"))
    }
}
