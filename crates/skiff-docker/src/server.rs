//! Docker API server over a unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use skiff_core::ContainerBackend;
use tokio::net::UnixListener;
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::api::create_router;
use crate::error::{DockerError, Result};

/// Docker API server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket path.
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".skiff")
        .join("docker.sock")
}

/// Docker API server.
pub struct DockerApiServer {
    config: ServerConfig,
    backend: Arc<ContainerBackend>,
}

impl DockerApiServer {
    #[must_use]
    pub const fn new(config: ServerConfig, backend: Arc<ContainerBackend>) -> Self {
        Self { config, backend }
    }

    /// Returns the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Runs the accept loop until the task is cancelled.
    ///
    /// Each connection is served on its own task with upgrade support so
    /// attach and interactive exec can hijack the stream.
    pub async fn run(&self) -> Result<()> {
        // A stale socket from an unclean shutdown blocks the bind.
        let _ = std::fs::remove_file(&self.config.socket_path);
        if let Some(parent) = self.config.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| DockerError::Server(e.to_string()))?;
        tracing::info!(
            "Docker API server listening on {}",
            self.config.socket_path.display()
        );

        let app = create_router(Arc::clone(&self.backend)).layer(TraceLayer::new_for_http());

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| DockerError::Server(e.to_string()))?;

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .with_upgrades()
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("shutting down")
                        && !err_str.contains("connection reset")
                        && !err_str.contains("broken pipe")
                    {
                        tracing::error!("Error serving connection: {}", err);
                    }
                }
            });
        }
    }
}
