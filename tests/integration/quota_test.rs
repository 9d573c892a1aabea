// tests/integration/quota_test.rs

//! Cluster-wide quota aggregation: local plus polled remote counters gate
//! write admission.

use super::fixtures::{GIB, tenant};
use super::test_helpers::TestNode;
use opalstore::OpalError;

async fn cluster_pair() -> (TestNode, TestNode) {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;
    let token = node_a.initialize_cluster().await;
    node_b.join(&node_a, &token).await;
    (node_a, node_b)
}

#[tokio::test]
async fn write_admission_sums_remote_usage() {
    // S5: quota 10 GiB, A holds 6 GiB, B holds 3 GiB.
    let (node_a, node_b) = cluster_pair().await;
    node_a.state.sync.upsert_local(tenant("t1", 10 * GIB));
    node_a.state.store.add_tenant_usage("t1", 6 * GIB);
    node_b.state.store.add_tenant_usage("t1", 3 * GIB);

    // 6 + 3 + 2 > 10: rejected.
    let err = node_a
        .state
        .quota
        .check_write("t1", 2 * GIB)
        .await
        .unwrap_err();
    assert!(matches!(err, OpalError::QuotaExceeded(_)));

    // 6 + 3 + 0.5 <= 10: admitted.
    node_a.state.quota.check_write("t1", GIB / 2).await.unwrap();
}

#[tokio::test]
async fn cluster_total_includes_all_nodes() {
    let (node_a, node_b) = cluster_pair().await;
    node_a.state.sync.upsert_local(tenant("t1", 0));
    node_a.state.store.add_tenant_usage("t1", 100);
    node_b.state.store.add_tenant_usage("t1", 250);

    let total = node_a.state.quota.tenant_total_storage("t1").await;
    assert_eq!(total, 350);
}

#[tokio::test]
async fn unreachable_peer_contributes_last_known_value() {
    let (node_a, node_b) = cluster_pair().await;
    node_a.state.sync.upsert_local(tenant("t1", 0));
    node_b.state.store.add_tenant_usage("t1", 500);

    // A successful poll caches B's counter on A.
    assert_eq!(node_a.state.quota.tenant_total_storage("t1").await, 500);

    // Take B off the air; the cached value keeps contributing.
    let b_id = node_b.state.store.local_node_id().unwrap();
    node_b.shutdown_tx.send(()).ok();
    if let Some(mut node) = node_a.state.store.nodes.get_mut(&b_id) {
        node.health_status = opalstore::core::entities::NodeHealth::Unreachable;
    }
    assert_eq!(node_a.state.quota.tenant_total_storage("t1").await, 500);
}
