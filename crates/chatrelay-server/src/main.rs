//! # chatrelay-server
//!
//! Chat relay hub.
//!
//! This binary provides:
//! - **Upstream connector** that follows one chat WebSocket and reconnects
//!   forever on a fixed delay
//! - **Relay hub** that fans every message out to subscribers, replaying
//!   recent history to each new one
//! - **Rotating chat log** on disk, by date and size, with bounded retention
//! - **HTTP API** (axum) for the subscriber WebSocket, health, recent
//!   messages, and read-only access to the chat logs

mod api;
mod config;
mod error;
mod hub;
mod logger;
mod replay;
mod session;
mod upstream;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chatrelay_shared::constants::APP_NAME;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::{HubConfig, RelayHub};
use crate::logger::RotatingLogger;
use crate::upstream::UpstreamConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatrelay_server=debug")),
        )
        .init();

    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Chat log (creates directory if missing)
    let logger = Arc::new(
        RotatingLogger::new(
            config.log_dir.clone(),
            config.log_max_bytes,
            config.log_max_files,
        )
        .await?,
    );

    let pruned = logger.enforce_retention().await?;
    if !pruned.is_empty() {
        info!(files = ?pruned, "Removed old chat logs");
    }
    // Open today's file now so an unwritable directory fails at startup.
    logger.rotate().await?;
    info!(dir = %logger.dir().display(), "Chat log ready");

    let (hub, hub_handle) = RelayHub::new(
        HubConfig {
            replay_capacity: config.replay_capacity,
            subscriber_queue: config.subscriber_queue,
        },
        logger.clone(),
    );

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();

    // -----------------------------------------------------------------------
    // 4. Spawn the hub and the upstream connector
    // -----------------------------------------------------------------------
    tasks.spawn(hub.run(shutdown.clone()));

    match config.upstream_url.clone() {
        Some(url) => {
            let connector = UpstreamConnector::new(url, hub_handle.clone(), config.reconnect_delay);
            tasks.spawn(connector.run(shutdown.clone()));
        }
        None => warn!("UPSTREAM_URL is empty, running without an upstream"),
    }

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until shutdown
    // -----------------------------------------------------------------------
    let app_state = AppState {
        hub: hub_handle,
        logger,
        tasks: tasks.clone(),
        shutdown: shutdown.clone(),
    };

    let server = tasks.spawn({
        let shutdown = shutdown.clone();
        let http_addr = config.http_addr;
        async move {
            let result = api::serve(app_state, http_addr).await;
            if let Err(e) = &result {
                error!(error = %e, "HTTP server failed");
            }
            // A dead listener takes the rest of the process down with it.
            shutdown.cancel();
            result
        }
    });

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    // -----------------------------------------------------------------------
    // 6. Wait for every task to wind down
    // -----------------------------------------------------------------------
    tasks.close();
    if tokio::time::timeout(config.shutdown_grace, tasks.wait())
        .await
        .is_err()
    {
        warn!(
            grace = ?config.shutdown_grace,
            remaining = tasks.len(),
            "Tasks still running after grace period, exiting anyway"
        );
        return Ok(());
    }

    match server.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
