// src/core/cluster/health.rs

//! Background peer health probing and the local bucket-count refresher.

use crate::core::cluster::client::PeerClient;
use crate::core::cluster::manager::ClusterManager;
use crate::core::entities::NodeHealth;
use crate::core::metastore::MetaStore;
use crate::core::metrics;
use crate::core::objects::ObjectManager;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Probes every peer on an interval and drives the health state machine.
pub struct HealthCheckerTask {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    manager: Arc<ClusterManager>,
    interval: Duration,
}

impl HealthCheckerTask {
    pub fn new(
        store: Arc<MetaStore>,
        peers: Arc<PeerClient>,
        manager: Arc<ClusterManager>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            peers,
            manager,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Health checker started (interval {:?}).", self.interval);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_all_peers().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Health checker shutting down.");
                    return;
                }
            }
        }
    }

    async fn probe_all_peers(&self) {
        if !self.store.is_cluster_enabled() {
            return;
        }
        let peers = self.store.peer_nodes();
        let probes = peers.iter().map(|node| {
            let client = self.peers.clone();
            let endpoint = node.endpoint.clone();
            async move { client.health(&endpoint).await.is_ok() }
        });
        for (node, success) in peers.iter().zip(join_all(probes).await) {
            self.manager.apply_probe_result(&node.id, success);
        }

        let nodes = self.manager.list_nodes();
        metrics::CLUSTER_NODES.set(nodes.len() as f64);
        metrics::CLUSTER_NODES_UNREACHABLE.set(
            nodes
                .iter()
                .filter(|n| n.health_status == NodeHealth::Unreachable)
                .count() as f64,
        );
    }
}

/// Periodically refreshes the local node row's bucket count so cross-node
/// listings show accurate totals.
pub struct BucketCountUpdaterTask {
    store: Arc<MetaStore>,
    objects: Arc<ObjectManager>,
    manager: Arc<ClusterManager>,
    interval: Duration,
}

impl BucketCountUpdaterTask {
    pub fn new(
        store: Arc<MetaStore>,
        objects: Arc<ObjectManager>,
        manager: Arc<ClusterManager>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            manager,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Bucket count updater started (interval {:?}).",
            self.interval
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.store.is_cluster_enabled() {
                        continue;
                    }
                    match self.objects.list_local_buckets(None).await {
                        Ok(buckets) => {
                            self.manager.update_local_bucket_count(buckets.len() as u64);
                        }
                        Err(e) => warn!("Could not count local buckets: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Bucket count updater shutting down.");
                    return;
                }
            }
        }
    }
}
