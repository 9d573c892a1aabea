// src/core/cluster/aggregator.rs

//! Read-side fan-out across the cluster: bucket listings tagged with their
//! residence, and tenant storage totals for quota admission. Unreachable
//! peers degrade the result instead of failing it.

use crate::core::OpalError;
use crate::core::cluster::client::PeerClient;
use crate::core::entities::{BucketInfo, NodeHealth};
use crate::core::metastore::MetaStore;
use crate::core::objects::manager::ObjectManager;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

/// Merges per-node bucket listings into one cluster-wide view.
#[derive(Debug)]
pub struct BucketAggregator {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    objects: Arc<ObjectManager>,
}

impl BucketAggregator {
    pub fn new(
        store: Arc<MetaStore>,
        peers: Arc<PeerClient>,
        objects: Arc<ObjectManager>,
    ) -> Self {
        Self {
            store,
            peers,
            objects,
        }
    }

    /// Lists buckets across the whole cluster, each tagged with the node it
    /// lives on. Peers that cannot be reached are logged and skipped.
    pub async fn list_buckets(&self, tenant_id: Option<&str>) -> Result<Vec<BucketInfo>, OpalError> {
        let local_id = self
            .store
            .local_node_id()
            .unwrap_or_else(|| "local".to_string());
        let local_name = self
            .store
            .cluster_config_snapshot()
            .map(|c| c.node_name)
            .unwrap_or_else(|| "local".to_string());

        let mut merged = self.objects.list_local_buckets(tenant_id).await?;
        for bucket in &mut merged {
            bucket.node_id = local_id.clone();
            bucket.node_name = local_name.clone();
        }

        let peers: Vec<_> = self
            .store
            .peer_nodes()
            .into_iter()
            .filter(|n| n.health_status != NodeHealth::Unreachable)
            .collect();
        let fetches = peers.iter().map(|node| {
            let client = self.peers.clone();
            let endpoint = node.endpoint.clone();
            let tenant = tenant_id.map(|t| t.to_string());
            async move { client.list_buckets(&endpoint, tenant.as_deref()).await }
        });
        for (node, result) in peers.iter().zip(join_all(fetches).await) {
            match result {
                Ok(mut buckets) => {
                    for bucket in &mut buckets {
                        bucket.node_id = node.id.clone();
                        bucket.node_name = node.name.clone();
                    }
                    merged.extend(buckets);
                }
                Err(e) => {
                    warn!(
                        "Skipping bucket listing from node '{}' ({}): {}",
                        node.name, node.id, e
                    );
                }
            }
        }
        merged.sort_by(|a, b| (&a.tenant_id, &a.name).cmp(&(&b.tenant_id, &b.name)));
        Ok(merged)
    }
}

/// Aggregates per-tenant storage counters across the fleet. Peers that
/// cannot be polled contribute their last known value, trading accuracy for
/// availability.
#[derive(Debug)]
pub struct QuotaAggregator {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    /// Last successfully polled counter per `(node_id, tenant_id)`.
    last_known: DashMap<(String, String), u64>,
}

impl QuotaAggregator {
    pub fn new(store: Arc<MetaStore>, peers: Arc<PeerClient>) -> Self {
        Self {
            store,
            peers,
            last_known: DashMap::new(),
        }
    }

    /// The cluster-wide storage total for a tenant, local counter included.
    pub async fn tenant_total_storage(&self, tenant_id: &str) -> u64 {
        self.store.tenant_usage_bytes(tenant_id) + self.remote_total(tenant_id).await
    }

    /// The sum of all remote counters for a tenant.
    pub async fn remote_total(&self, tenant_id: &str) -> u64 {
        let peers = self.store.peer_nodes();
        let polls = peers.iter().map(|node| {
            let client = self.peers.clone();
            let endpoint = node.endpoint.clone();
            let poll = node.health_status == NodeHealth::Healthy;
            let tenant = tenant_id.to_string();
            async move {
                if poll {
                    Some(client.tenant_storage(&endpoint, &tenant).await)
                } else {
                    None
                }
            }
        });

        let mut total = 0u64;
        for (node, result) in peers.iter().zip(join_all(polls).await) {
            let cache_key = (node.id.clone(), tenant_id.to_string());
            match result {
                Some(Ok(bytes)) => {
                    self.last_known.insert(cache_key, bytes);
                    total += bytes;
                }
                Some(Err(e)) => {
                    let stale = self.last_known.get(&cache_key).map(|e| *e.value());
                    warn!(
                        "Could not poll tenant '{}' storage from node '{}' ({}); \
                         using last known value {:?}.",
                        tenant_id, node.id, e, stale
                    );
                    total += stale.unwrap_or(0);
                }
                None => {
                    // Degraded or unreachable peer: last known value stands in.
                    total += self
                        .last_known
                        .get(&cache_key)
                        .map(|e| *e.value())
                        .unwrap_or(0);
                }
            }
        }
        total
    }

    /// Admission check run before accepting a client write. Rejects when the
    /// fleet-wide total plus the incoming size would exceed the tenant quota.
    pub async fn check_write(
        &self,
        tenant_id: &str,
        incoming_bytes: u64,
    ) -> Result<(), OpalError> {
        let Some(tenant) = self.store.tenants.get(tenant_id).map(|e| e.value().clone()) else {
            return Err(OpalError::NotFound(format!("unknown tenant '{tenant_id}'")));
        };
        if tenant.max_storage_bytes == 0 {
            return Ok(());
        }
        let local = self.store.tenant_usage_bytes(tenant_id);
        let remote = self.remote_total(tenant_id).await;
        if local + incoming_bytes + remote > tenant.max_storage_bytes {
            return Err(OpalError::QuotaExceeded(tenant_id.to_string()));
        }
        Ok(())
    }
}
