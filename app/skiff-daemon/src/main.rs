use anyhow::{Context, Result};
use clap::Parser;
use skiff_core::ports::NoopForwarder;
use skiff_core::{ContainerBackend, EventMonitor};
use skiff_docker::{DockerApiServer, ServerConfig};
use skiff_portlayer::{HttpPortLayer, KvStore, PortLayer, PortLayerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "skiff-daemon")]
#[command(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Unix socket path for the Docker API (default: <data-dir>/docker.sock).
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Port-layer address, host:port.
    #[arg(long, default_value = "localhost:2377")]
    pub portlayer: String,

    /// Data directory for Skiff.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Public interface address accepted in port bindings besides 0.0.0.0.
    #[arg(long)]
    pub public_ip: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff=info,skiff_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(DaemonArgs::parse()).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    info!("Starting Skiff daemon...");

    let data_dir = resolve_data_dir(args.data_dir.as_ref());
    let pid_file = data_dir.join("daemon.pid");
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("Failed to write daemon PID file")?;

    let socket_path = args.socket.unwrap_or_else(|| data_dir.join("docker.sock"));

    let portlayer: Arc<dyn PortLayer> =
        Arc::new(HttpPortLayer::new(PortLayerConfig::new(args.portlayer.clone())));

    // The port layer may still be coming up; a failed probe is worth a
    // warning but not a refusal to start.
    match portlayer.ping().await {
        Ok(()) => info!(address = %args.portlayer, "port layer reachable"),
        Err(e) => warn!(address = %args.portlayer, "port layer not answering yet: {e}"),
    }

    let backend = Arc::new(ContainerBackend::new(
        Arc::clone(&portlayer),
        Arc::new(NoopForwarder),
        args.public_ip,
    ));

    if let Err(e) = backend
        .images()
        .load(portlayer.as_ref() as &dyn KvStore)
        .await
    {
        warn!("image cache hydration failed, starting empty: {e}");
    }

    let monitor = EventMonitor::start(Arc::clone(&backend));

    let docker_server = DockerApiServer::new(
        ServerConfig {
            socket_path: socket_path.clone(),
        },
        Arc::clone(&backend),
    );
    let docker_handle = tokio::spawn(async move {
        if let Err(e) = docker_server.run().await {
            tracing::error!("Docker API server error: {}", e);
        }
    });

    println!("Skiff daemon started");
    println!("  Docker API: {}", socket_path.display());
    println!("  Port layer: {}", args.portlayer);
    println!("  Data:       {}", data_dir.display());
    println!();
    println!("Press Ctrl+C to stop.");

    shutdown_signal().await;
    info!("Shutdown signal received");

    docker_handle.abort();
    monitor.shutdown().await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket {}: {}", socket_path.display(), e);
        }
    }
    if let Err(e) = std::fs::remove_file(&pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove PID file {}: {}", pid_file.display(), e);
        }
    }

    info!("Skiff daemon stopped");
    Ok(())
}

fn resolve_data_dir(data_dir: Option<&PathBuf>) -> PathBuf {
    data_dir.cloned().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(".skiff"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/skiff"))
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
