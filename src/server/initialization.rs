// src/server/initialization.rs

//! Handles the complete server initialization process: state setup,
//! metastore loading, and binding both listeners.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::ServerState;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all server components before starting the main loop.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let server_init = ServerState::initialize(config.clone(), log_reload_handle)?;
    let server_state = server_init.state.clone();

    if server_state.store.is_cluster_enabled() {
        info!(
            "Server starting in CLUSTER mode. Node ID: {}",
            server_state
                .store
                .local_node_id()
                .unwrap_or_else(|| "unknown".to_string())
        );
        info!("Ensure all cluster nodes have their system clocks synchronized using NTP.");
    } else {
        info!("Server starting in STANDALONE mode.");
    }

    let api_listener = TcpListener::bind((config.api_host.as_str(), config.api_port)).await?;
    info!(
        "OpalStore API listening on {}:{}",
        config.api_host, config.api_port
    );
    let console_listener =
        TcpListener::bind((config.console_host.as_str(), config.console_port)).await?;
    info!(
        "OpalStore console listening on {}:{}",
        config.console_host, config.console_port
    );

    Ok(ServerContext {
        state: server_state,
        init_channels: Some(server_init),
        api_listener: Some(api_listener),
        console_listener: Some(console_listener),
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Data directory: {:?}; storage root: {:?}.",
        config.data_dir, config.storage_root
    );
    info!(
        "Cluster tunables: sync every {:?}, health probe every {:?}, clock skew {:?}.",
        config.cluster.sync_interval,
        config.cluster.health_check_interval,
        config.cluster.clock_skew
    );
}
