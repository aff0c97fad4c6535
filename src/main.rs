//! kvraft -- replicated key/value front-end node.
//!
//! Nodes start Stopped.  The event loop begins when the node is told to
//! start (`PUT /api/v1/cluster`), when a leader heartbeat reaches it, or at
//! boot with `cluster.auto_start`.  Nothing is persisted by the replication
//! layer, so every restart rejoins with an empty log and catches up.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kvraft::cluster::Cluster;
use kvraft::config::{Config, LoggingConfig};

/// Command-line arguments for the kvraft server.
#[derive(Parser, Debug)]
#[command(name = "kvraft", version, about = "Replicated key/value front-end node")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply without one.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Address peers use to reach this node.
    #[arg(long)]
    self_address: Option<String>,

    /// Additional peer address; may be repeated.
    #[arg(long = "peer")]
    peers: Vec<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => kvraft::config::load_config(path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    if let Some(address) = cli.self_address {
        config.cluster.self_address = address;
    }
    if config.cluster.self_address.is_empty() {
        config.cluster.self_address = bind_addr.clone();
    }
    config.cluster.peers.extend(cli.peers);

    if config.observability.metrics {
        kvraft::metrics::init_metrics()?;
        kvraft::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let store = kvraft::storage::from_config(&config.storage)?;
    info!(backend = store.name(), "storage initialized");

    let self_address = config.cluster.self_address.clone();
    let cluster = Arc::new(Cluster::from_config(
        &config.cluster,
        &self_address,
        store,
    )?);
    info!(
        address = %self_address,
        peers = ?cluster.peers(),
        "cluster node created"
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let auto_start = config.cluster.auto_start;
    let state = Arc::new(kvraft::AppState {
        config,
        cluster: Arc::clone(&cluster),
    });
    let app = kvraft::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("kvraft listening on {}", bind_addr);

    if auto_start {
        if let Err(err) = cluster.start(false).await {
            warn!(error = %err, "auto start skipped");
        }
    }

    // On SIGTERM/SIGINT stop accepting connections, then give in-flight
    // requests `shutdown_timeout` to finish.
    let (drain_tx, mut drain_rx) = tokio::sync::watch::channel(false);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = drain_tx.send(true);
    });
    let deadline = async move {
        if drain_rx.wait_for(|draining| *draining).await.is_ok() {
            tokio::time::sleep(shutdown_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        result = serve.into_future() => result?,
        _ = deadline => warn!("shutdown timeout elapsed with requests in flight"),
    }

    if let Err(err) = cluster.stop().await {
        warn!(error = %err, "event loop did not stop cleanly");
    }
    info!("kvraft shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
