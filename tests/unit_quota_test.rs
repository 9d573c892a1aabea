// tests/unit_quota_test.rs

//! Quota admission math on a single node. The cross-node aggregation path
//! is covered by the integration suite.

#[path = "integration/test_helpers.rs"]
mod test_helpers;
#[path = "integration/fixtures.rs"]
mod fixtures;

use bytes::Bytes;
use fixtures::{GIB, tenant};
use opalstore::OpalError;
use std::collections::HashMap;
use test_helpers::new_env;

#[tokio::test]
async fn write_within_quota_is_admitted() {
    let env = new_env();
    env.state.sync.upsert_local(tenant("t1", 10 * GIB));
    env.state.store.add_tenant_usage("t1", 6 * GIB);
    env.state.quota.check_write("t1", 2 * GIB).await.unwrap();
}

#[tokio::test]
async fn write_exceeding_quota_is_rejected() {
    let env = new_env();
    env.state.sync.upsert_local(tenant("t1", 10 * GIB));
    env.state.store.add_tenant_usage("t1", 9 * GIB);
    let err = env.state.quota.check_write("t1", 2 * GIB).await.unwrap_err();
    assert!(matches!(err, OpalError::QuotaExceeded(_)));
}

#[tokio::test]
async fn exact_fit_is_admitted() {
    let env = new_env();
    env.state.sync.upsert_local(tenant("t1", 10 * GIB));
    env.state.store.add_tenant_usage("t1", 9 * GIB);
    env.state.quota.check_write("t1", GIB).await.unwrap();
}

#[tokio::test]
async fn zero_quota_means_unlimited() {
    let env = new_env();
    env.state.sync.upsert_local(tenant("t1", 0));
    env.state.store.add_tenant_usage("t1", 100 * GIB);
    env.state.quota.check_write("t1", 100 * GIB).await.unwrap();
}

#[tokio::test]
async fn unknown_tenant_is_rejected() {
    let env = new_env();
    let err = env.state.quota.check_write("ghost", 1).await.unwrap_err();
    assert!(matches!(err, OpalError::NotFound(_)));
}

#[tokio::test]
async fn rejected_put_leaves_counters_untouched() {
    let env = new_env();
    env.state.cluster.initialize_cluster().unwrap();
    env.state.sync.upsert_local(tenant("t1", 10));
    env.state.objects.create_bucket("t1", "b").await.unwrap();

    let err = env
        .state
        .objects
        .put_object("t1", "b", "big", Bytes::from(vec![0u8; 64]), None, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OpalError::QuotaExceeded(_)));
    assert_eq!(env.state.store.tenant_usage_bytes("t1"), 0);
}
