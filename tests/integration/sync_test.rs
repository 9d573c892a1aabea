// tests/integration/sync_test.rs

//! Control-plane sync over the wire: LWW application, tombstone
//! suppression, resurrection, and delete propagation between two live nodes.

use super::fixtures::{tenant_at, tenant_user};
use super::test_helpers::TestNode;
use opalstore::core::cluster::wire::{DeleteOutcome, DeleteSyncRequest, SyncOutcome};
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
async fn pushed_entity_lands_on_the_peer() {
    let (node_a, node_b) = cluster_pair().await;

    let outcome = node_b
        .state
        .peers
        .push_entity(&node_a.endpoint(), &tenant_at("t1", 100))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Inserted);

    let row: Tenant = node_a.state.store.get_entity("t1").unwrap();
    assert_eq!(row.updated_at, 100);
}

#[tokio::test]
async fn lww_applies_over_the_wire() {
    let (node_a, node_b) = cluster_pair().await;
    let push = |t: Tenant| {
        let peers = node_b.state.peers.clone();
        let endpoint = node_a.endpoint();
        async move { peers.push_entity(&endpoint, &t).await.unwrap() }
    };

    assert_eq!(push(tenant_at("t1", 100)).await, SyncOutcome::Inserted);
    assert_eq!(push(tenant_at("t1", 300)).await, SyncOutcome::Updated);
    assert_eq!(push(tenant_at("t1", 200)).await, SyncOutcome::SkippedLww);

    let row: Tenant = node_a.state.store.get_entity("t1").unwrap();
    assert_eq!(row.updated_at, 300);
}

#[tokio::test]
async fn tombstone_wins_over_late_sync() {
    // S2: create at 100, delete at 200, stale payload at 150 is skipped.
    let (node_a, node_b) = cluster_pair().await;
    node_b
        .state
        .peers
        .push_entity(&node_a.endpoint(), &tenant_at("t1", 100))
        .await
        .unwrap();

    let delete = DeleteSyncRequest {
        entity_id: "t1".to_string(),
        deleted_at: 200,
        deleted_by_node: "node-b".to_string(),
    };
    let outcome = node_b
        .state
        .peers
        .push_delete(&node_a.endpoint(), EntityKind::Tenant, &delete)
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::Deleted);

    let outcome = node_b
        .state
        .peers
        .push_entity(&node_a.endpoint(), &tenant_at("t1", 150))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::SkippedTombstone);
    assert!(EntityStore::<Tenant>::get_entity(&*node_a.state.store, "t1").is_none());
}

#[tokio::test]
async fn newer_payload_resurrects_over_the_wire() {
    // S3: tombstone at 300, payload at 400 resurrects the user.
    let (node_a, node_b) = cluster_pair().await;
    let delete = DeleteSyncRequest {
        entity_id: "u1".to_string(),
        deleted_at: 300,
        deleted_by_node: "node-b".to_string(),
    };
    node_b
        .state
        .peers
        .push_delete(&node_a.endpoint(), EntityKind::User, &delete)
        .await
        .unwrap();

    let outcome = node_b
        .state
        .peers
        .push_entity(&node_a.endpoint(), &tenant_user("u1", "t1", 400))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Inserted);
    assert!(EntityStore::<User>::get_entity(&*node_a.state.store, "u1").is_some());
    assert!(
        node_a
            .state
            .store
            .tombstone_for(EntityKind::User, "u1")
            .is_some(),
        "tombstone is retained after resurrection"
    );
}

#[tokio::test]
async fn local_delete_propagates_to_peers() {
    let (node_a, node_b) = cluster_pair().await;

    // Seed the same tenant on both nodes.
    node_a.state.sync.upsert_local(tenant_at("t1", 100));
    node_b
        .state
        .store
        .upsert_entity(tenant_at("t1", 100));

    node_a.state.sync.delete_local::<Tenant>("t1").await.unwrap();

    assert!(EntityStore::<Tenant>::get_entity(&*node_a.state.store, "t1").is_none());
    assert!(EntityStore::<Tenant>::get_entity(&*node_b.state.store, "t1").is_none());
    assert!(
        node_b
            .state
            .store
            .tombstone_for(EntityKind::Tenant, "t1")
            .is_some()
    );
}
