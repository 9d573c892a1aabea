// src/core/cluster/router.rs

//! Bucket location routing. Answers "which node owns this bucket" by fanning
//! a probe to self and all peers, and caches affirmative answers with a TTL.

use crate::core::OpalError;
use crate::core::cluster::client::PeerClient;
use crate::core::entities::MigrationState;
use crate::core::metastore::MetaStore;
use crate::core::metrics;
use crate::core::objects::manager::ObjectManager;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    node_id: String,
    cached_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Resolves bucket paths (`tenant/bucket`) to the node that currently owns
/// them, with a per-entry TTL cache.
#[derive(Debug)]
pub struct LocationRouter {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    objects: Arc<ObjectManager>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocationRouter {
    pub fn new(
        store: Arc<MetaStore>,
        peers: Arc<PeerClient>,
        objects: Arc<ObjectManager>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            peers,
            objects,
            cache: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolves the primary node for a bucket. The local node is consulted
    /// first, then every peer in parallel; the first affirmative answer wins.
    pub async fn resolve(&self, bucket: &str) -> Result<String, OpalError> {
        if let Some(entry) = self.cache.get(bucket) {
            if entry.cached_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::LOCATION_CACHE_HITS_TOTAL.inc();
                return Ok(entry.node_id.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::LOCATION_CACHE_MISSES_TOTAL.inc();

        // Local residence check first: no network round trip for our own buckets.
        if self.objects.owns_bucket(bucket).await {
            let node_id = self
                .store
                .local_node_id()
                .unwrap_or_else(|| "local".to_string());
            self.insert(bucket, &node_id);
            return Ok(node_id);
        }

        let peers = self.store.peer_nodes();
        let probes = peers.iter().map(|node| {
            let client = self.peers.clone();
            let endpoint = node.endpoint.clone();
            let node_id = node.id.clone();
            let bucket = bucket.to_string();
            async move {
                match client.bucket_owner(&endpoint, &bucket).await {
                    Ok(true) => Some(node_id),
                    Ok(false) => None,
                    Err(e) => {
                        debug!("Bucket probe to node '{}' failed: {}", node_id, e);
                        None
                    }
                }
            }
        });
        for owner in join_all(probes).await.into_iter().flatten() {
            self.insert(bucket, &owner);
            return Ok(owner);
        }

        Err(OpalError::NotFound(format!("no such bucket '{bucket}'")))
    }

    /// Rejects writes to a bucket whose migration is mid-cutover; routing a
    /// write there would land it on a node about to lose the bucket.
    pub fn ensure_writable(&self, bucket: &str) -> Result<(), OpalError> {
        let blocked = self.store.migrations.iter().any(|e| {
            e.value().bucket == bucket && e.value().state == MigrationState::CuttingOver
        });
        if blocked {
            return Err(OpalError::Conflict(format!(
                "bucket '{bucket}' is cutting over to another node"
            )));
        }
        Ok(())
    }

    fn insert(&self, bucket: &str, node_id: &str) {
        self.cache.insert(
            bucket.to_string(),
            CacheEntry {
                node_id: node_id.to_string(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Drops the cached location so the next resolve performs a fresh fan-out.
    pub fn invalidate(&self, bucket: &str) {
        if self.cache.remove(bucket).is_some() {
            debug!("Invalidated location cache entry for bucket '{}'.", bucket);
        }
    }

    /// Pushes an invalidation to every peer, best effort. Used as the final
    /// step of a migration cutover.
    pub async fn invalidate_cluster_wide(&self, bucket: &str) {
        self.invalidate(bucket);
        for node in self.store.peer_nodes() {
            if let Err(e) = self.peers.invalidate_cache(&node.endpoint, bucket).await {
                warn!(
                    "Failed to push cache invalidation for '{}' to node '{}': {}",
                    bucket, node.id, e
                );
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.cache.len(),
        }
    }

    /// Removes entries past their TTL. Correctness does not depend on this;
    /// it only bounds memory on churny buckets.
    pub fn evict_expired(&self) -> usize {
        let before = self.cache.len();
        let ttl = self.ttl;
        self.cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - self.cache.len()
    }
}
