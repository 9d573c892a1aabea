// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

pub mod control_api;
pub mod envelope;
pub mod internal_api;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

/// Background tasks get this long to drain after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Initialize server state and bind both listeners.
    let mut server_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn all background tasks and the HTTP servers.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Wait for a shutdown signal, then drain within the grace period.
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received; stopping background tasks.");
    let _ = server_context.shutdown_tx.send(());

    let drain = async {
        while let Some(result) = server_context.background_tasks.join_next().await {
            if let Ok(Err(e)) = result {
                warn!("Background task exited with error: {}", e);
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            "Background tasks did not drain within {:?}; aborting the rest.",
            SHUTDOWN_GRACE
        );
        server_context.background_tasks.abort_all();
    }
    info!("Server stopped.");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
