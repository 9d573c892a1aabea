// src/server/context.rs

use crate::core::state::{ServerInit, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Carries everything between the initialization, spawning, and serving
/// phases of startup.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    pub init_channels: Option<ServerInit>,
    pub api_listener: Option<TcpListener>,
    pub console_listener: Option<TcpListener>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
}
