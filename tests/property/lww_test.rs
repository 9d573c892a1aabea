// tests/property/lww_test.rs

//! Last-Writer-Wins convergence properties: any delivery order of the same
//! payload set converges to the same row, and re-application is idempotent.

use opalstore::core::cluster::sync::{apply_incoming, apply_incoming_delete};
use opalstore::core::cluster::wire::DeleteSyncRequest;
use opalstore::core::entities::{EntityKind, Tenant};
use opalstore::core::metastore::{EntityStore, MetaStore};
use proptest::prelude::*;
use tempfile::TempDir;

fn tenant_at(updated_at: i64) -> Tenant {
    Tenant {
        id: "t1".to_string(),
        name: "tenant".to_string(),
        max_storage_bytes: 0,
        max_buckets: 0,
        enabled: true,
        created_at: updated_at,
        updated_at,
    }
}

fn fresh_store() -> (MetaStore, TempDir) {
    let dir = TempDir::new().unwrap();
    (MetaStore::open(dir.path()).unwrap(), dir)
}

proptest! {
    /// Applying the same payloads in two different orders converges to the
    /// same surviving timestamp: the maximum.
    #[test]
    fn delivery_order_does_not_matter(
        mut timestamps in proptest::collection::vec(1i64..1_000_000, 1..20),
        seed in any::<u64>(),
    ) {
        let (forward, _d1) = fresh_store();
        for &ts in &timestamps {
            apply_incoming(&forward, tenant_at(ts));
        }

        // A cheap deterministic shuffle driven by the seed.
        let len = timestamps.len();
        for i in 0..len {
            let j = ((seed as usize).wrapping_mul(31).wrapping_add(i * 7)) % len;
            timestamps.swap(i, j);
        }
        let (shuffled, _d2) = fresh_store();
        for &ts in &timestamps {
            apply_incoming(&shuffled, tenant_at(ts));
        }

        let a: Tenant = forward.get_entity("t1").unwrap();
        let b: Tenant = shuffled.get_entity("t1").unwrap();
        prop_assert_eq!(a.updated_at, b.updated_at);
        prop_assert_eq!(a.updated_at, *timestamps.iter().max().unwrap());
    }

    /// Applying a payload twice leaves the store exactly as applying it once.
    #[test]
    fn application_is_idempotent(timestamps in proptest::collection::vec(1i64..1_000_000, 1..20)) {
        let (store, _dir) = fresh_store();
        for &ts in &timestamps {
            apply_incoming(&store, tenant_at(ts));
        }
        let before: Tenant = store.get_entity("t1").unwrap();
        for &ts in &timestamps {
            apply_incoming(&store, tenant_at(ts));
        }
        let after: Tenant = store.get_entity("t1").unwrap();
        prop_assert_eq!(before.updated_at, after.updated_at);
    }

    /// Whatever order payloads and a tombstone arrive in, the row exists
    /// afterwards iff some payload is strictly newer than the deletion.
    #[test]
    fn tombstone_outcome_depends_only_on_timestamps(
        timestamps in proptest::collection::vec(1i64..1000, 1..10),
        deleted_at in 1i64..1000,
        delete_position in 0usize..10,
    ) {
        let (store, _dir) = fresh_store();
        let delete = DeleteSyncRequest {
            entity_id: "t1".to_string(),
            deleted_at,
            deleted_by_node: "n".to_string(),
        };

        let position = delete_position.min(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            if i == position {
                apply_incoming_delete(&store, EntityKind::Tenant, &delete);
            }
            apply_incoming(&store, tenant_at(ts));
        }
        if position >= timestamps.len() {
            apply_incoming_delete(&store, EntityKind::Tenant, &delete);
        }

        let survives = EntityStore::<Tenant>::get_entity(&store, "t1").is_some();
        let newest = *timestamps.iter().max().unwrap();
        // The row can only be present if something was newer than the delete.
        if survives {
            prop_assert!(newest > deleted_at);
        } else {
            // Everything the store saw after the delete was stale.
            prop_assert!(timestamps[position..].iter().all(|&ts| ts <= deleted_at));
        }
    }
}
