//! Dropgate Server
//!
//! Ephemeral file transfer server: upload once, share a link, and the file
//! disappears after its download limit or lifetime runs out.

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dropgate_server::maintenance::{self, snapshot};
use dropgate_server::{routes, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "dropgate_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Dropgate Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", config.storage.data_dir.display());
    tracing::info!("Public URL: {}", config.server.public_url);

    let state = AppState::new(config.clone());

    // Restore the previous run before accepting anything
    match snapshot::restore(state.store(), &config.storage.snapshot_path).await {
        Ok(count) => tracing::info!("Restored {} files from snapshot", count),
        Err(e) => tracing::error!("Failed to restore snapshot: {}. Starting empty", e),
    }

    match maintenance::integrity_sweep(state.store(), state.blobs()).await {
        Ok(report) if report.total() > 0 => tracing::info!(
            orphaned_blobs = report.orphaned_blobs,
            incomplete_records = report.incomplete_records,
            missing_blobs = report.missing_blobs,
            "Startup integrity sweep repaired storage"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!("Startup integrity sweep failed: {}", e),
    }

    let shutdown = CancellationToken::new();
    maintenance::spawn_loops(&state, &shutdown).context("Failed to start maintenance loops")?;

    let app = routes::app(state.clone());

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Dropgate Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();

    match snapshot::save(state.store(), &config.storage.snapshot_path).await {
        Ok(count) => tracing::info!("Final snapshot saved with {} files", count),
        Err(e) => tracing::error!("Failed to save final snapshot: {}", e),
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
