// src/core/cluster/snapshot.rs

//! Full-state snapshots and the stale-node reconciler. A node that was cut
//! off from every peer longer than the staleness threshold reconciles on
//! reconnect: adopt-remote when it had no local writes during the isolation,
//! bidirectional LWW merge when it did.

use crate::core::cluster::client::PeerClient;
use crate::core::cluster::sync::{apply_incoming, apply_incoming_delete};
use crate::core::cluster::wire::{DeleteSyncRequest, SnapshotTable, StateSnapshot};
use crate::core::entities::{
    AccessKey, BucketAcl, BucketConfig, BucketPermission, EntityKind, IdpGroupMapping,
    IdpProvider, NodeHealth, Replicated, Tenant, User,
};
use crate::core::metastore::{EntityStore, MetaStore};
use crate::core::{OpalError, now_ms};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// The reconciliation strategy chosen when a stale node reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// No local writes happened during the isolation: the remote snapshot is
    /// adopted as authoritative (row-wise LWW still applies).
    Offline,
    /// Local writes happened: merge both directions under LWW.
    Partition,
}

fn table_of<T: Replicated>(store: &MetaStore) -> Result<SnapshotTable, OpalError>
where
    MetaStore: EntityStore<T>,
{
    let rows = EntityStore::<T>::all_entities(store)
        .into_iter()
        .map(|row| serde_json::to_value(&row))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SnapshotTable {
        kind: T::KIND,
        rows,
    })
}

/// Builds the full snapshot of every replicated table plus tombstones.
pub fn build_snapshot(store: &MetaStore) -> Result<StateSnapshot, OpalError> {
    Ok(StateSnapshot {
        node_id: store.local_node_id().unwrap_or_else(|| "local".to_string()),
        taken_at: now_ms(),
        tables: vec![
            table_of::<Tenant>(store)?,
            table_of::<User>(store)?,
            table_of::<AccessKey>(store)?,
            table_of::<BucketPermission>(store)?,
            table_of::<BucketAcl>(store)?,
            table_of::<BucketConfig>(store)?,
            table_of::<IdpProvider>(store)?,
            table_of::<IdpGroupMapping>(store)?,
        ],
        tombstones: store.tombstones.iter().map(|e| e.value().clone()).collect(),
    })
}

fn import_table<T: Replicated>(store: &MetaStore, table: &SnapshotTable) -> usize
where
    MetaStore: EntityStore<T>,
{
    let mut applied = 0;
    for raw in &table.rows {
        match serde_json::from_value::<T>(raw.clone()) {
            Ok(row) => {
                applied += 1;
                apply_incoming(store, row);
            }
            Err(e) => warn!("Skipping malformed {} snapshot row: {}", table.kind, e),
        }
    }
    applied
}

/// Imports a peer snapshot. Tombstones first, so stale rows in the snapshot
/// body cannot transiently resurrect deleted entities; then every table,
/// row-wise under the ordinary LWW rules.
pub fn import_snapshot(store: &MetaStore, snapshot: &StateSnapshot) -> usize {
    for tombstone in &snapshot.tombstones {
        let request = DeleteSyncRequest {
            entity_id: tombstone.entity_id.clone(),
            deleted_at: tombstone.deleted_at,
            deleted_by_node: tombstone.deleted_by_node.clone(),
        };
        apply_incoming_delete(store, tombstone.entity_type, &request);
    }

    let mut applied = 0;
    for table in &snapshot.tables {
        applied += match table.kind {
            EntityKind::Tenant => import_table::<Tenant>(store, table),
            EntityKind::User => import_table::<User>(store, table),
            EntityKind::AccessKey => import_table::<AccessKey>(store, table),
            EntityKind::BucketPermission => import_table::<BucketPermission>(store, table),
            EntityKind::BucketAcl => import_table::<BucketAcl>(store, table),
            EntityKind::BucketConfig => import_table::<BucketConfig>(store, table),
            EntityKind::IdpProvider => import_table::<IdpProvider>(store, table),
            EntityKind::IdpGroupMapping => import_table::<IdpGroupMapping>(store, table),
        };
    }
    applied
}

/// Watches for the local node coming back from an isolation longer than the
/// staleness threshold, and reconciles against the first reachable peer.
pub struct StaleReconcilerTask {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    check_interval: Duration,
    stale_after: Duration,
}

impl StaleReconcilerTask {
    pub fn new(
        store: Arc<MetaStore>,
        peers: Arc<PeerClient>,
        check_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            peers,
            check_interval,
            stale_after,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Stale reconciler started (stale after {:?}).",
            self.stale_after
        );
        let mut interval = tokio::time::interval(self.check_interval);
        let mut isolated_since: Option<(Instant, i64)> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut isolated_since).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Stale reconciler shutting down.");
                    return;
                }
            }
        }
    }

    async fn tick(&self, isolated_since: &mut Option<(Instant, i64)>) {
        if !self.store.is_cluster_enabled() {
            return;
        }
        let peers = self.store.peer_nodes();
        if peers.is_empty() {
            return;
        }
        let reachable: Vec<_> = peers
            .iter()
            .filter(|n| n.health_status != NodeHealth::Unreachable)
            .collect();

        if reachable.is_empty() {
            if isolated_since.is_none() {
                warn!("All peers unreachable; tracking isolation window.");
                *isolated_since = Some((Instant::now(), now_ms()));
            }
            return;
        }

        let Some((since, partition_start_ms)) = *isolated_since else {
            return;
        };
        if since.elapsed() < self.stale_after {
            // Short blip, no reconciliation needed.
            *isolated_since = None;
            return;
        }

        let mode = self.select_mode(partition_start_ms);
        info!(
            "Reconnected after {:?} of isolation; reconciling in {:?} mode.",
            since.elapsed(),
            mode
        );
        if let Some(peer) = reachable.first() {
            if let Err(e) = self.reconcile_with(&peer.endpoint, mode).await {
                warn!("Snapshot reconciliation with '{}' failed: {}", peer.id, e);
                // Leave the isolation marker so the next tick retries.
                return;
            }
        }
        *isolated_since = None;
    }

    /// Offline when the local node wrote nothing while isolated, else a true
    /// partition with writes on both sides.
    fn select_mode(&self, partition_start_ms: i64) -> ReconcileMode {
        let last_write = self
            .store
            .last_local_write_at
            .load(std::sync::atomic::Ordering::Relaxed);
        if last_write < partition_start_ms {
            ReconcileMode::Offline
        } else {
            ReconcileMode::Partition
        }
    }

    pub async fn reconcile_with(
        &self,
        endpoint: &str,
        mode: ReconcileMode,
    ) -> Result<(), OpalError> {
        let remote = self.peers.fetch_snapshot(endpoint).await?;
        let applied = import_snapshot(&self.store, &remote);
        info!(
            "Imported snapshot from '{}': {} rows considered.",
            remote.node_id, applied
        );

        if mode == ReconcileMode::Partition {
            // Our writes from inside the partition flow back the same way.
            let local = build_snapshot(&self.store)?;
            self.peers.push_snapshot(endpoint, &local).await?;
            info!("Pushed local snapshot back for bidirectional merge.");
        }
        Ok(())
    }
}

/// Collects tombstones that have outlived the retention window. Sweeping
/// only runs while every known peer is healthy, which stands in for all
/// nodes having acknowledged the deletions.
pub struct TombstoneSweeperTask {
    store: Arc<MetaStore>,
    retention: Duration,
    sweep_interval: Duration,
}

impl TombstoneSweeperTask {
    pub fn new(store: Arc<MetaStore>, retention: Duration, sweep_interval: Duration) -> Self {
        Self {
            store,
            retention,
            sweep_interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Tombstone sweeper started (retention {:?}).",
            self.retention
        );
        let mut interval = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = shutdown_rx.recv() => {
                    info!("Tombstone sweeper shutting down.");
                    return;
                }
            }
        }
    }

    fn sweep(&self) {
        let all_peers_healthy = self
            .store
            .peer_nodes()
            .iter()
            .all(|n| n.health_status == NodeHealth::Healthy);
        if !all_peers_healthy {
            return;
        }
        let horizon = now_ms() - self.retention.as_millis() as i64;
        let before = self.store.tombstones.len();
        self.store.tombstones.retain(|_, t| t.deleted_at >= horizon);
        let swept = before - self.store.tombstones.len();
        if swept > 0 {
            self.store.mark_dirty();
            info!("Swept {} expired tombstone(s).", swept);
        }
    }
}
