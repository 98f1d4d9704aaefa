//! Port-layer event bridge.

use std::sync::Arc;
use std::time::Duration;

use skiff_error::Result;
use skiff_portlayer::models::PortLayerEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::ContainerBackend;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Long-running bridge from the port-layer event stream to the engine.
///
/// Reads the NDJSON long-poll stream and hands each decoded event to the
/// backend for translation. A dropped stream reconnects after a short
/// backoff until shut down; undecodable lines are skipped, not fatal.
pub struct EventMonitor {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl EventMonitor {
    #[must_use]
    pub fn start(backend: Arc<ContainerBackend>) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            return;
                        }
                    }
                    result = Self::pump(&backend) => {
                        match result {
                            Ok(()) => debug!("event stream ended, reconnecting"),
                            Err(e) => warn!("event stream failed: {e}"),
                        }
                        tokio::select! {
                            _ = stopped.changed() => {
                                if *stopped.borrow() {
                                    return;
                                }
                            }
                            () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        }
                    }
                }
            }
        });
        Self { stop, task }
    }

    async fn pump(backend: &ContainerBackend) -> Result<()> {
        let stream = backend.portlayer().event_stream().await?;
        info!("port-layer event stream connected");
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PortLayerEvent>(&line) {
                Ok(event) => {
                    debug!(container = %event.r#ref, kind = %event.event, "port-layer event");
                    backend.handle_portlayer_event(&event).await;
                }
                Err(e) => debug!("skipping undecodable event line: {e}"),
            }
        }
        Ok(())
    }

    /// Stops the bridge and waits for the pump to wind down.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, HostConfig};
    use crate::event::action;
    use crate::ports::NoopForwarder;
    use crate::testutil::FakePortLayer;
    use skiff_cache::{ImageConfig, ImageDefaults};
    use skiff_portlayer::PortLayer;

    #[tokio::test]
    async fn removed_events_from_the_stream_evict_the_cache() {
        let fake = FakePortLayer::new();
        let portlayer: Arc<dyn PortLayer> = fake.clone();
        let backend = Arc::new(ContainerBackend::new(
            portlayer,
            Arc::new(NoopForwarder),
            None,
        ));
        backend.images().add(ImageConfig {
            image_id: "deadbeef01".to_string(),
            layer_id: "layer0".to_string(),
            name: "busybox".to_string(),
            tags: vec!["latest".to_string()],
            digests: Vec::new(),
            parent: None,
            size: 1024,
            created: chrono::Utc::now(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ImageDefaults {
                cmd: vec!["/bin/sh".to_string()],
                ..ImageDefaults::default()
            },
        });

        let container = backend
            .create(
                Some("web".to_string()),
                ContainerConfig {
                    image: "busybox".to_string(),
                    ..ContainerConfig::default()
                },
                HostConfig::default(),
            )
            .await
            .unwrap();

        let line = format!(
            "{{\"Ref\":\"{}\",\"Event\":\"ContainerRemoved\",\"CreatedAt\":\"2024-05-01T12:00:00Z\"}}\n",
            container.id
        );
        fake.events.lock().unwrap().extend_from_slice(line.as_bytes());

        let mut rx = backend.events().subscribe();
        let monitor = EventMonitor::start(Arc::clone(&backend));

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.action == action::DESTROY {
                    return event;
                }
            }
        })
        .await
        .expect("destroy event from the bridge");
        assert_eq!(event.actor.id, container.id);
        assert!(backend.require("web").is_err());

        monitor.shutdown().await;
    }
}
