// src/core/cluster/manager.rs

//! Cluster membership and lifecycle: initialize, join, leave, node CRUD,
//! health transitions, and the shared token.

use crate::core::cluster::client::PeerClient;
use crate::core::cluster::wire::Envelope;
use crate::core::entities::{ClusterConfig, Node, NodeHealth};
use crate::core::metastore::MetaStore;
use crate::core::{OpalError, now_ms};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Settings key under which the shared JWT secret is persisted.
const JWT_SECRET_SETTING: &str = "jwt_secret";

/// A condensed view of the cluster for the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub is_cluster_enabled: bool,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub region: Option<String>,
    pub node_count: usize,
    pub healthy_nodes: usize,
    pub unreachable_nodes: usize,
}

/// Fields accepted by a node update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug)]
pub struct ClusterManager {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    jwt_secret: Arc<RwLock<String>>,
    advertised_endpoint: String,
    node_name: String,
    region: String,
    failure_threshold: u32,
    http: reqwest::Client,
}

impl ClusterManager {
    pub fn new(
        store: Arc<MetaStore>,
        peers: Arc<PeerClient>,
        jwt_secret: Arc<RwLock<String>>,
        advertised_endpoint: String,
        node_name: String,
        region: String,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            peers,
            jwt_secret,
            advertised_endpoint,
            node_name,
            region,
            failure_threshold,
            http: reqwest::Client::builder().build().unwrap_or_default(),
        }
    }

    /// Generates a URL-safe cluster token with 256 bits of entropy.
    pub fn generate_cluster_token() -> Result<String, OpalError> {
        let mut raw = [0u8; 32];
        getrandom::fill(&mut raw).map_err(|e| OpalError::Internal(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn self_node(&self, node_id: &str) -> Node {
        Node {
            id: node_id.to_string(),
            name: self.node_name.clone(),
            endpoint: self.advertised_endpoint.clone(),
            region: self.region.clone(),
            health_status: NodeHealth::Healthy,
            last_heartbeat_at: now_ms(),
            bucket_count: 0,
            last_local_write_at: now_ms(),
            consecutive_failures: 0,
        }
    }

    /// Creates a brand new single-node cluster and returns its config,
    /// including the freshly minted token.
    pub fn initialize_cluster(&self) -> Result<ClusterConfig, OpalError> {
        {
            let existing = self.store.cluster_config.read();
            if existing.is_some() {
                return Err(OpalError::AlreadyInitialized);
            }
        }
        let node_id = uuid::Uuid::new_v4().to_string();
        let config = ClusterConfig {
            is_cluster_enabled: true,
            node_id: node_id.clone(),
            node_name: self.node_name.clone(),
            cluster_token: Self::generate_cluster_token()?,
            region: self.region.clone(),
            created_at: now_ms(),
        };
        *self.store.cluster_config.write() = Some(config.clone());
        self.store.nodes.insert(node_id.clone(), self.self_node(&node_id));
        self.store.mark_dirty();
        info!(
            "Cluster initialized; this node is '{}' ({}).",
            self.node_name, node_id
        );
        Ok(config)
    }

    /// Joins an existing cluster through one of its members. Token first,
    /// then registration, then the shared JWT secret so client sessions are
    /// valid fleet-wide.
    pub async fn join_cluster(
        &self,
        cluster_token: &str,
        remote_endpoint: &str,
    ) -> Result<(), OpalError> {
        if self.store.is_cluster_enabled() {
            return Err(OpalError::AlreadyInCluster);
        }
        self.peers
            .validate_token(remote_endpoint, cluster_token)
            .await?;

        let node_id = uuid::Uuid::new_v4().to_string();
        let registered = self
            .peers
            .register_node(remote_endpoint, cluster_token, self.self_node(&node_id))
            .await?;

        let config = ClusterConfig {
            is_cluster_enabled: true,
            node_id: node_id.clone(),
            node_name: self.node_name.clone(),
            cluster_token: cluster_token.to_string(),
            region: registered.region.clone(),
            created_at: now_ms(),
        };
        *self.store.cluster_config.write() = Some(config);
        for node in registered.nodes {
            self.store.nodes.insert(node.id.clone(), node);
        }
        self.store
            .nodes
            .insert(node_id.clone(), self.self_node(&node_id));
        self.store.mark_dirty();

        // Sessions must survive being routed to any node, so the joiner
        // adopts the cluster's signing secret.
        match self.peers.jwt_secret(remote_endpoint).await {
            Ok(secret) => {
                *self.jwt_secret.write() = secret.clone();
                self.store.settings.insert(JWT_SECRET_SETTING.to_string(), secret);
                self.store.mark_dirty();
            }
            Err(e) => warn!(
                "Joined cluster but could not pull the shared JWT secret: {}",
                e
            ),
        }
        info!(
            "Joined cluster via {} as node '{}' ({}).",
            remote_endpoint, self.node_name, node_id
        );
        Ok(())
    }

    /// Leaves the cluster. Peers are not called; their health checkers will
    /// mark this node unreachable and an operator removes the stale row.
    pub fn leave_cluster(&self) -> Result<(), OpalError> {
        if !self.store.is_cluster_enabled() {
            return Err(OpalError::NotInCluster);
        }
        *self.store.cluster_config.write() = None;
        self.store.nodes.clear();
        self.store.mark_dirty();
        info!("Left the cluster; node is standalone again.");
        Ok(())
    }

    /// Registers a peer presented by the join handshake and returns the full
    /// node list for the joiner's bootstrap.
    pub fn accept_registration(&self, node: Node) -> Result<Vec<Node>, OpalError> {
        if !self.store.is_cluster_enabled() {
            return Err(OpalError::NotInCluster);
        }
        info!("Registering joining node '{}' ({}).", node.name, node.id);
        self.store.nodes.insert(node.id.clone(), node);
        self.store.mark_dirty();
        Ok(self.list_nodes())
    }

    /// Validates a presented token against ours in constant-ish time.
    pub fn validate_token(&self, presented: &str) -> Result<(), OpalError> {
        let expected = self.store.cluster_token().ok_or(OpalError::NotInCluster)?;
        let matches = expected.len() == presented.len()
            && expected
                .bytes()
                .zip(presented.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if matches {
            Ok(())
        } else {
            Err(OpalError::BadToken)
        }
    }

    /// Control-plane convenience: instructs a standalone remote node to join
    /// this cluster, using the remote's own admin credentials.
    pub async fn add_node(
        &self,
        remote_console_url: &str,
        remote_admin_token: &str,
    ) -> Result<(), OpalError> {
        let token = self.store.cluster_token().ok_or(OpalError::NotInCluster)?;
        let base = remote_console_url.trim_end_matches('/');

        let status: ClusterStatus = self
            .console_get(&format!("{base}/cluster/status"), remote_admin_token)
            .await?;
        if status.is_cluster_enabled {
            return Err(OpalError::Conflict(
                "remote node is already part of a cluster".to_string(),
            ));
        }

        #[derive(Serialize)]
        struct JoinBody<'a> {
            cluster_token: &'a str,
            node_endpoint: &'a str,
        }
        let response = self
            .http
            .post(format!("{base}/cluster/join"))
            .bearer_auth(remote_admin_token)
            .json(&JoinBody {
                cluster_token: &token,
                node_endpoint: &self.advertised_endpoint,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OpalError::HttpClient(format!(
                "remote join returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn console_get<R: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        bearer: &str,
    ) -> Result<R, OpalError> {
        let response = self.http.get(url).bearer_auth(bearer).send().await?;
        let envelope: Envelope<R> = response.json().await?;
        envelope
            .data
            .ok_or_else(|| OpalError::HttpClient("remote returned no data".to_string()))
    }

    // --- Node CRUD ---

    pub fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<_> = self.store.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn get_node(&self, id: &str) -> Result<Node, OpalError> {
        self.store
            .nodes
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OpalError::NotFound(format!("no such node '{id}'")))
    }

    pub fn update_node(&self, id: &str, update: NodeUpdate) -> Result<Node, OpalError> {
        let mut entry = self
            .store
            .nodes
            .get_mut(id)
            .ok_or_else(|| OpalError::NotFound(format!("no such node '{id}'")))?;
        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(endpoint) = update.endpoint {
            entry.endpoint = endpoint;
        }
        if let Some(region) = update.region {
            entry.region = region;
        }
        let updated = entry.value().clone();
        drop(entry);
        self.store.mark_dirty();
        Ok(updated)
    }

    /// Removes a peer row. The local node cannot remove itself this way;
    /// that is what leave is for.
    pub fn remove_node(&self, id: &str) -> Result<(), OpalError> {
        if self.store.local_node_id().as_deref() == Some(id) {
            return Err(OpalError::Validation(
                "cannot remove the local node; use leave instead".to_string(),
            ));
        }
        self.store
            .nodes
            .remove(id)
            .ok_or_else(|| OpalError::NotFound(format!("no such node '{id}'")))?;
        self.store.mark_dirty();
        info!("Removed node '{}' from the cluster view.", id);
        Ok(())
    }

    /// Probes one peer immediately and applies the health transition.
    pub async fn check_node_health(&self, id: &str) -> Result<Node, OpalError> {
        let node = self.get_node(id)?;
        if self.store.local_node_id().as_deref() == Some(id) {
            return Ok(node);
        }
        let healthy = self.peers.health(&node.endpoint).await.is_ok();
        self.apply_probe_result(id, healthy);
        self.get_node(id)
    }

    /// Health state machine: any success resets to healthy; consecutive
    /// failures walk healthy -> degraded -> unreachable at the configured
    /// threshold per step.
    pub fn apply_probe_result(&self, id: &str, success: bool) {
        let Some(mut entry) = self.store.nodes.get_mut(id) else {
            return;
        };
        if success {
            if entry.health_status != NodeHealth::Healthy {
                info!("Node '{}' is healthy again.", id);
            }
            entry.health_status = NodeHealth::Healthy;
            entry.consecutive_failures = 0;
            entry.last_heartbeat_at = now_ms();
        } else {
            entry.consecutive_failures += 1;
            let failures = entry.consecutive_failures;
            match entry.health_status {
                NodeHealth::Healthy if failures >= self.failure_threshold => {
                    warn!("Node '{}' degraded after {} failed probes.", id, failures);
                    entry.health_status = NodeHealth::Degraded;
                    entry.consecutive_failures = 0;
                }
                NodeHealth::Degraded if failures >= self.failure_threshold => {
                    warn!(
                        "Node '{}' unreachable after {} more failed probes.",
                        id, failures
                    );
                    entry.health_status = NodeHealth::Unreachable;
                    entry.consecutive_failures = 0;
                }
                _ => {}
            }
        }
        drop(entry);
        self.store.mark_dirty();
    }

    /// Refreshes the local node row so peers display accurate totals.
    pub fn update_local_bucket_count(&self, count: u64) {
        let Some(local_id) = self.store.local_node_id() else {
            return;
        };
        if let Some(mut entry) = self.store.nodes.get_mut(&local_id) {
            entry.bucket_count = count;
            entry.last_heartbeat_at = now_ms();
            entry.last_local_write_at = self
                .store
                .last_local_write_at
                .load(std::sync::atomic::Ordering::Relaxed);
            drop(entry);
            self.store.mark_dirty();
        }
    }

    pub fn status(&self) -> ClusterStatus {
        let config = self.store.cluster_config_snapshot();
        let nodes = self.list_nodes();
        ClusterStatus {
            is_cluster_enabled: config.as_ref().is_some_and(|c| c.is_cluster_enabled),
            node_id: config.as_ref().map(|c| c.node_id.clone()),
            node_name: config.as_ref().map(|c| c.node_name.clone()),
            region: config.as_ref().map(|c| c.region.clone()),
            node_count: nodes.len(),
            healthy_nodes: nodes
                .iter()
                .filter(|n| n.health_status == NodeHealth::Healthy)
                .count(),
            unreachable_nodes: nodes
                .iter()
                .filter(|n| n.health_status == NodeHealth::Unreachable)
                .count(),
        }
    }

    /// The persisted JWT secret, if one was adopted from the cluster.
    pub fn persisted_jwt_secret(store: &MetaStore) -> Option<String> {
        store.settings.get(JWT_SECRET_SETTING).map(|e| e.value().clone())
    }
}
