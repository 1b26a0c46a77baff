mod cleanup;
mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ferry_transfer::TransferService;
use tracing::{info, warn};

use crate::config::Config;
use crate::routes::AppState;

/// How often finished transfer records are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=debug,ferry_transfer=info,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let backend = config.store.connect().await?;
    info!("Object store backend: {}", backend.name());

    tokio::fs::create_dir_all(&config.transfer.staging_dir)
        .await
        .with_context(|| format!("creating {}", config.transfer.staging_dir.display()))?;
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("creating {}", config.upload_dir.display()))?;

    let service = TransferService::new(Arc::new(backend), config.transfer.clone());
    tokio::spawn(cleanup::run_cleanup_loop(
        service.clone(),
        CLEANUP_INTERVAL,
        config.status_retention,
    ));
    let state = AppState::new(service, &config.base_url, config.upload_dir.clone());
    let app = routes::app(state, config.max_upload_bytes);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Ferry listening on {}", addr);
    info!(
        "Chunk size {} bytes, {} concurrent store operations per transfer",
        config.transfer.chunk_size, config.transfer.concurrency
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM where the platform has it.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Interrupted, draining connections"),
        _ = terminate => info!("Terminated, draining connections"),
    }
}
