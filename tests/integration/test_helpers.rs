// tests/integration/test_helpers.rs

//! Shared helpers for spinning up in-process OpalStore nodes, either as a
//! bare `ServerState` for unit-style tests or as a full node with both HTTP
//! listeners bound on ephemeral ports.

use opalstore::config::Config;
use opalstore::core::state::{ServerInit, ServerState};
use opalstore::server::{control_api, internal_api};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing_subscriber::{filter::EnvFilter, reload};

#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";

#[allow(dead_code)]
pub struct TestEnv {
    pub state: Arc<ServerState>,
    pub init: ServerInit,
    data_dir: TempDir,
    storage_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn storage_path(&self) -> &std::path::Path {
        self.storage_dir.path()
    }

    pub fn data_path(&self) -> &std::path::Path {
        self.data_dir.path()
    }
}

#[allow(dead_code)]
pub fn log_handle() -> Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>> {
    let (_filter, handle) =
        reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(EnvFilter::new("warn"));
    Arc::new(handle)
}

#[allow(dead_code)]
pub fn base_config(data_dir: &TempDir, storage_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.path().to_path_buf();
    config.storage_root = storage_dir.path().to_path_buf();
    config.admin_api_token = Some(ADMIN_TOKEN.to_string());
    config.region = "test-region".to_string();
    config
}

/// Builds a full `ServerState` backed by temp directories, with no listeners
/// and no background workers.
#[allow(dead_code)]
pub fn new_env() -> TestEnv {
    let data_dir = TempDir::new().expect("temp data dir");
    let storage_dir = TempDir::new().expect("temp storage dir");
    let config = base_config(&data_dir, &storage_dir);
    let init = ServerState::initialize(config, log_handle()).expect("state init");
    TestEnv {
        state: init.state.clone(),
        init,
        data_dir,
        storage_dir,
    }
}

/// A full node: state plus both HTTP listeners on ephemeral ports.
#[allow(dead_code)]
pub struct TestNode {
    pub state: Arc<ServerState>,
    pub init: ServerInit,
    pub api_addr: SocketAddr,
    pub console_addr: SocketAddr,
    pub shutdown_tx: broadcast::Sender<()>,
    pub http: reqwest::Client,
    data_dir: TempDir,
    storage_dir: TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn spawn(name: &str) -> Self {
        let data_dir = TempDir::new().expect("temp data dir");
        let storage_dir = TempDir::new().expect("temp storage dir");

        let api_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind api listener");
        let console_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind console listener");
        let api_addr = api_listener.local_addr().expect("api addr");
        let console_addr = console_listener.local_addr().expect("console addr");

        let mut config = base_config(&data_dir, &storage_dir);
        config.api_port = api_addr.port();
        config.console_port = console_addr.port();
        config.node_name = Some(name.to_string());
        config.public_api_url = Some(format!("http://{api_addr}"));
        config.public_console_url = Some(format!("http://{console_addr}"));

        let init = ServerState::initialize(config, log_handle()).expect("state init");
        let state = init.state.clone();
        let (shutdown_tx, _) = broadcast::channel(1);

        let internal =
            axum::Router::new().nest("/cluster/internal", internal_api::router(state.clone()));
        let mut api_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(
                api_listener,
                internal.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                api_shutdown.recv().await.ok();
            })
            .await
            .ok();
        });

        let gate: Arc<dyn control_api::AdminGate> = Arc::new(control_api::StaticTokenGate::new(
            Some(ADMIN_TOKEN.to_string()),
        ));
        let console = control_api::router(state.clone(), gate);
        let mut console_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(
                console_listener,
                console.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                console_shutdown.recv().await.ok();
            })
            .await
            .ok();
        });

        Self {
            state,
            init,
            api_addr,
            console_addr,
            shutdown_tx,
            http: reqwest::Client::new(),
            data_dir,
            storage_dir,
        }
    }

    /// The endpoint peers use to reach this node.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    pub fn console_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.console_addr)
    }

    pub async fn console_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> (u16, serde_json::Value) {
        let response = self
            .http
            .post(self.console_url(path))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .expect("console post");
        let status = response.status().as_u16();
        let json = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub async fn console_get(&self, path: &str) -> (u16, serde_json::Value) {
        let response = self
            .http
            .get(self.console_url(path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .expect("console get");
        let status = response.status().as_u16();
        let json = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    /// Initializes a fresh cluster on this node, returning the token.
    pub async fn initialize_cluster(&self) -> String {
        let (status, body) = self
            .console_post("/cluster/initialize", serde_json::json!({}))
            .await;
        assert_eq!(status, 200, "initialize failed: {body}");
        body["data"]["cluster_token"]
            .as_str()
            .expect("cluster token in response")
            .to_string()
    }

    /// Joins the cluster that `seed` belongs to.
    pub async fn join(&self, seed: &TestNode, token: &str) {
        let (status, body) = self
            .console_post(
                "/cluster/join",
                serde_json::json!({
                    "cluster_token": token,
                    "node_endpoint": seed.endpoint(),
                }),
            )
            .await;
        assert_eq!(status, 200, "join failed: {body}");
    }
}
