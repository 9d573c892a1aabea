// tests/integration/snapshot_test.rs

//! Snapshot build/import over the wire, including the bidirectional merge a
//! partitioned node performs on reconnect.

use super::fixtures::{tenant_at, tenant_user};
use super::test_helpers::TestNode;
use opalstore::core::cluster::snapshot::build_snapshot;
use opalstore::core::cluster::sync::apply_incoming_delete;
use opalstore::core::cluster::wire::DeleteSyncRequest;
use opalstore::core::entities::{EntityKind, Tenant, User};
use opalstore::core::metastore::EntityStore;

async fn cluster_pair() -> (TestNode, TestNode) {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;
    let token = node_a.initialize_cluster().await;
    node_b.join(&node_a, &token).await;
    (node_a, node_b)
}

#[tokio::test]
async fn snapshot_carries_entities_and_tombstones() {
    let (node_a, node_b) = cluster_pair().await;
    node_a.state.store.upsert_entity(tenant_at("t1", 100));
    node_a.state.store.upsert_entity(tenant_user("u1", "t1", 100));
    apply_incoming_delete(
        &node_a.state.store,
        EntityKind::User,
        &DeleteSyncRequest {
            entity_id: "u-deleted".to_string(),
            deleted_at: 90,
            deleted_by_node: "node-a".to_string(),
        },
    );

    let snapshot = node_b
        .state
        .peers
        .fetch_snapshot(&node_a.endpoint())
        .await
        .unwrap();
    assert_eq!(snapshot.node_id, node_a.state.store.local_node_id().unwrap());
    assert!(snapshot.tombstones.iter().any(|t| t.entity_id == "u-deleted"));
    let tenants = snapshot
        .tables
        .iter()
        .find(|t| t.kind == EntityKind::Tenant)
        .unwrap();
    assert_eq!(tenants.rows.len(), 1);
}

#[tokio::test]
async fn pushed_snapshot_merges_with_lww() {
    let (node_a, node_b) = cluster_pair().await;

    // A has a newer copy of t1 and an exclusive t2; B holds a newer t3.
    node_a.state.store.upsert_entity(tenant_at("t1", 300));
    node_a.state.store.upsert_entity(tenant_at("t2", 100));
    node_b.state.store.upsert_entity(tenant_at("t1", 200));
    node_b.state.store.upsert_entity(tenant_at("t3", 500));

    let local = build_snapshot(&node_b.state.store).unwrap();
    node_b
        .state
        .peers
        .push_snapshot(&node_a.endpoint(), &local)
        .await
        .unwrap();

    // A kept its newer t1, kept t2, and learned t3.
    let t1: Tenant = node_a.state.store.get_entity("t1").unwrap();
    assert_eq!(t1.updated_at, 300);
    assert!(EntityStore::<Tenant>::get_entity(&*node_a.state.store, "t2").is_some());
    let t3: Tenant = node_a.state.store.get_entity("t3").unwrap();
    assert_eq!(t3.updated_at, 500);
}

#[tokio::test]
async fn imported_tombstones_suppress_snapshot_rows() {
    let (node_a, node_b) = cluster_pair().await;

    // B deleted u1 at 200 while A still carries the stale row from 150.
    node_a.state.store.upsert_entity(tenant_user("u1", "t1", 150));
    apply_incoming_delete(
        &node_b.state.store,
        EntityKind::User,
        &DeleteSyncRequest {
            entity_id: "u1".to_string(),
            deleted_at: 200,
            deleted_by_node: "node-b".to_string(),
        },
    );

    let snapshot = build_snapshot(&node_b.state.store).unwrap();
    node_b
        .state
        .peers
        .push_snapshot(&node_a.endpoint(), &snapshot)
        .await
        .unwrap();

    assert!(EntityStore::<User>::get_entity(&*node_a.state.store, "u1").is_none());
    assert!(
        node_a
            .state
            .store
            .tombstone_for(EntityKind::User, "u1")
            .is_some()
    );
}
