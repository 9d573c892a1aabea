// tests/unit_metastore_test.rs

//! Metastore round trips: image flush/reload, watermarks, tenant usage
//! counters, and the dirty flag.

#[path = "integration/fixtures.rs"]
mod fixtures;

use fixtures::tenant_at;
use opalstore::core::entities::{EntityKind, Tenant, Tombstone};
use opalstore::core::metastore::{EntityStore, MetaStore, persistence};
use tempfile::TempDir;

#[tokio::test]
async fn flush_and_reload_round_trips_all_tables() {
    let dir = TempDir::new().unwrap();
    {
        let store = MetaStore::open(dir.path()).unwrap();
        store.upsert_entity(tenant_at("t1", 100));
        store.put_tombstone(Tombstone {
            entity_type: EntityKind::User,
            entity_id: "u1".to_string(),
            deleted_at: 50,
            deleted_by_node: "node-a".to_string(),
        });
        store.set_watermark(EntityKind::Tenant, 100);
        store.add_tenant_usage("t1", 4096);
        store
            .kv
            .insert("integrity_scans:t1/b1".to_string(), serde_json::json!([1, 2]));
        persistence::flush(&store).await.unwrap();
    }

    let reloaded = MetaStore::open(dir.path()).unwrap();
    let tenant: Tenant = reloaded.get_entity("t1").unwrap();
    assert_eq!(tenant.updated_at, 100);
    assert_eq!(
        reloaded.tombstone_for(EntityKind::User, "u1").unwrap().deleted_at,
        50
    );
    assert_eq!(reloaded.watermark(EntityKind::Tenant), 100);
    assert_eq!(reloaded.tenant_usage_bytes("t1"), 4096);
    assert_eq!(
        reloaded.kv.get("integrity_scans:t1/b1").unwrap().value(),
        &serde_json::json!([1, 2])
    );
}

#[tokio::test]
async fn dirty_flag_is_set_by_mutations_and_taken_once() {
    let dir = TempDir::new().unwrap();
    let store = MetaStore::open(dir.path()).unwrap();
    assert!(!store.take_dirty(), "fresh store is clean");

    store.upsert_entity(tenant_at("t1", 1));
    assert!(store.take_dirty());
    assert!(!store.take_dirty(), "taking clears the flag");
}

#[test]
fn usage_counters_saturate_at_zero() {
    let dir = TempDir::new().unwrap();
    let store = MetaStore::open(dir.path()).unwrap();
    assert_eq!(store.add_tenant_usage("t1", 100), 100);
    assert_eq!(store.sub_tenant_usage("t1", 40), 60);
    assert_eq!(store.sub_tenant_usage("t1", 1000), 0);
}

#[test]
fn watermark_defaults_to_zero() {
    let dir = TempDir::new().unwrap();
    let store = MetaStore::open(dir.path()).unwrap();
    assert_eq!(store.watermark(EntityKind::AccessKey), 0);
}

#[test]
fn remove_entity_reports_absence() {
    let dir = TempDir::new().unwrap();
    let store = MetaStore::open(dir.path()).unwrap();
    store.upsert_entity(tenant_at("t1", 1));
    assert!(EntityStore::<Tenant>::remove_entity(&store, "t1").is_some());
    assert!(EntityStore::<Tenant>::remove_entity(&store, "t1").is_none());
}

#[test]
fn peer_nodes_excludes_the_local_row() {
    let dir = TempDir::new().unwrap();
    let store = MetaStore::open(dir.path()).unwrap();
    assert!(store.peer_nodes().is_empty());
}
