// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Cluster Gauges ---
    /// The number of peers currently known to this node, including itself.
    pub static ref CLUSTER_NODES: Gauge =
        register_gauge!("opalstore_cluster_nodes", "Number of nodes known to this cluster member.").unwrap();
    /// The number of peers currently marked unreachable.
    pub static ref CLUSTER_NODES_UNREACHABLE: Gauge =
        register_gauge!("opalstore_cluster_nodes_unreachable", "Number of peers currently marked unreachable.").unwrap();
    /// The current depth of the object replication queue.
    pub static ref REPLICATION_QUEUE_DEPTH: Gauge =
        register_gauge!("opalstore_replication_queue_depth", "Tasks waiting in the object replication queue.").unwrap();

    // --- Cluster Counters ---
    /// Sync payloads pushed to peers, labeled by entity kind.
    pub static ref SYNC_PUSHES_TOTAL: CounterVec =
        register_counter_vec!("opalstore_sync_pushes_total", "Entity sync payloads pushed to peers, by entity kind.", &["kind"]).unwrap();
    /// Incoming sync payloads applied, skipped by LWW, or blocked by a tombstone.
    pub static ref SYNC_APPLIED_TOTAL: CounterVec =
        register_counter_vec!("opalstore_sync_applied_total", "Incoming sync payload outcomes.", &["outcome"]).unwrap();
    /// Signed inter-node request verifications, labeled by outcome.
    pub static ref RPC_VERIFICATIONS_TOTAL: CounterVec =
        register_counter_vec!("opalstore_rpc_verifications_total", "HMAC verification outcomes for inter-node requests.", &["outcome"]).unwrap();
    /// Bucket location cache hits.
    pub static ref LOCATION_CACHE_HITS_TOTAL: Counter =
        register_counter!("opalstore_location_cache_hits_total", "Bucket location cache hits.").unwrap();
    /// Bucket location cache misses.
    pub static ref LOCATION_CACHE_MISSES_TOTAL: Counter =
        register_counter!("opalstore_location_cache_misses_total", "Bucket location cache misses.").unwrap();
    /// Objects pushed to peers by the replication workers.
    pub static ref OBJECTS_REPLICATED_TOTAL: Counter =
        register_counter!("opalstore_objects_replicated_total", "Objects successfully replicated to peers.").unwrap();
    /// Replication tasks abandoned after exhausting retries.
    pub static ref REPLICATION_DEAD_LETTERS_TOTAL: Counter =
        register_counter!("opalstore_replication_dead_letters_total", "Replication tasks moved to the dead letter list.").unwrap();
    /// Objects found corrupted or missing by the integrity scrubber.
    pub static ref INTEGRITY_ISSUES_TOTAL: Counter =
        register_counter!("opalstore_integrity_issues_total", "Corrupted or missing objects detected by integrity scans.").unwrap();
    /// Notifications dropped due to slow subscribers.
    pub static ref DROPPED_NOTIFICATIONS_TOTAL: Counter =
        register_counter!("opalstore_dropped_notifications_total", "Notifications dropped because a subscriber buffer overflowed.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
