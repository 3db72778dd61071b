//! Mesh Cache - a clustered, fully replicated in-memory cache
//!
//! Starts an in-process cluster and serves its admin API over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mesh_cache::api::create_router;
use mesh_cache::{spawn_reaper_task, AppState, Cluster, Config};

/// Main entry point for the Mesh Cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Start the cluster nodes
/// 4. Start the background expiry reaper
/// 5. Create Axum router with all endpoints
/// 6. Start HTTP server on configured port
/// 7. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mesh Cache");

    let config = Config::from_env();
    info!(
        "Configuration loaded: cluster_size={}, max_entries={}, replication_timeout={}ms, sweep_interval={}ms, port={}",
        config.cluster_size,
        config.max_entries,
        config.replication_timeout_ms,
        config.sweep_interval_ms,
        config.server_port
    );

    let cluster = Arc::new(Cluster::start(&config)?);
    let state = AppState::new(cluster.clone());

    let reaper = spawn_reaper_task(cluster.clone(), config.sweep_interval());
    info!("Expiry reaper started");

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(reaper))
        .await?;

    cluster.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the reaper and allows graceful shutdown.
async fn shutdown_signal(reaper: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    reaper.abort();
    warn!("Expiry reaper aborted");
}
