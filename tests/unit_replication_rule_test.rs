// tests/unit_replication_rule_test.rs

//! Replication rule validation and the priority behavior of the queue.

#[path = "integration/test_helpers.rs"]
mod test_helpers;
#[path = "integration/fixtures.rs"]
mod fixtures;

use fixtures::{peer_node, tenant};
use opalstore::OpalError;
use opalstore::core::entities::BucketReplicationRule;
use opalstore::core::cluster::replication::{ReplicationOp, ReplicationTask};
use test_helpers::{TestEnv, new_env};

fn rule(destination_node_id: &str) -> BucketReplicationRule {
    BucketReplicationRule {
        id: String::new(),
        tenant_id: "t1".to_string(),
        source_bucket: "photos".to_string(),
        destination_node_id: destination_node_id.to_string(),
        destination_bucket: "photos-replica".to_string(),
        sync_interval_secs: 60,
        enabled: true,
        replicate_deletes: true,
        replicate_metadata: true,
        prefix: String::new(),
        priority: 0,
        objects_replicated: 0,
        bytes_replicated: 0,
        last_sync_at: None,
        last_error: None,
        created_at: 0,
        updated_at: 0,
    }
}

fn setup() -> TestEnv {
    let env = new_env();
    env.state.cluster.initialize_cluster().unwrap();
    env.state
        .store
        .nodes
        .insert("node-b".to_string(), peer_node("node-b", "http://127.0.0.1:1"));
    env.state.sync.upsert_local(tenant("t1", 0));
    env
}

#[test]
fn valid_rule_is_created_with_generated_id() {
    let env = setup();
    let created = env.state.replication.create_rule(rule("node-b")).unwrap();
    assert!(!created.id.is_empty());
    assert!(created.created_at > 0);
    assert_eq!(env.state.replication.list_rules().len(), 1);
}

#[test]
fn self_replication_is_rejected() {
    let env = setup();
    let local_id = env.state.store.local_node_id().unwrap();
    let err = env
        .state
        .replication
        .create_rule(rule(&local_id))
        .unwrap_err();
    assert!(matches!(err, OpalError::Validation(_)));
}

#[test]
fn unknown_destination_node_is_rejected() {
    let env = setup();
    let err = env
        .state
        .replication
        .create_rule(rule("node-missing"))
        .unwrap_err();
    assert!(matches!(err, OpalError::NotFound(_)));
}

#[test]
fn unknown_tenant_is_rejected() {
    let env = setup();
    let mut bad = rule("node-b");
    bad.tenant_id = "no-such-tenant".to_string();
    let err = env.state.replication.create_rule(bad).unwrap_err();
    assert!(matches!(err, OpalError::NotFound(_)));
}

#[test]
fn interval_below_floor_is_rejected() {
    let env = setup();
    let mut bad = rule("node-b");
    bad.sync_interval_secs = 5;
    let err = env.state.replication.create_rule(bad).unwrap_err();
    assert!(matches!(err, OpalError::Validation(_)));
}

#[test]
fn update_preserves_id_and_created_at() {
    let env = setup();
    let created = env.state.replication.create_rule(rule("node-b")).unwrap();
    let mut changed = created.clone();
    changed.prefix = "2024/".to_string();
    let updated = env
        .state
        .replication
        .update_rule(&created.id, changed)
        .unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.created_at, created.created_at);
    assert_eq!(updated.prefix, "2024/");
}

#[test]
fn delete_rule_removes_it() {
    let env = setup();
    let created = env.state.replication.create_rule(rule("node-b")).unwrap();
    env.state.replication.delete_rule(&created.id).unwrap();
    assert!(env.state.replication.get_rule(&created.id).is_none());
    assert!(matches!(
        env.state.replication.delete_rule(&created.id),
        Err(OpalError::NotFound(_))
    ));
}

#[test]
fn higher_priority_tasks_jump_the_queue() {
    let env = setup();
    let manager = &env.state.replication;
    let task = |key: &str, priority: u8| ReplicationTask {
        rule_id: "r1".to_string(),
        key: key.to_string(),
        op: ReplicationOp::Put,
        priority,
        attempt: 0,
    };
    manager.enqueue(task("low-1", 0)).unwrap();
    manager.enqueue(task("low-2", 0)).unwrap();
    manager.enqueue(task("high", 5)).unwrap();
    assert_eq!(manager.queue_depth(), 3);
}
