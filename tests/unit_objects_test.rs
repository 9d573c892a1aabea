// tests/unit_objects_test.rs

//! Object manager behavior: writes, counters, pagination, and bucket rules.

#[path = "integration/test_helpers.rs"]
mod test_helpers;
#[path = "integration/fixtures.rs"]
mod fixtures;

use bytes::Bytes;
use fixtures::tenant;
use opalstore::OpalError;
use opalstore::core::objects::manager::{compute_etag, split_bucket_path};
use std::collections::HashMap;
use test_helpers::{TestEnv, new_env};

async fn setup() -> TestEnv {
    let env = new_env();
    env.state.cluster.initialize_cluster().unwrap();
    env.state.sync.upsert_local(tenant("t1", 0));
    env.state.objects.create_bucket("t1", "photos").await.unwrap();
    env
}

#[test]
fn bucket_paths_must_have_two_segments() {
    assert_eq!(split_bucket_path("t1/photos").unwrap(), ("t1", "photos"));
    assert!(split_bucket_path("photos").is_err());
    assert!(split_bucket_path("/photos").is_err());
    assert!(split_bucket_path("t1/").is_err());
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let env = setup().await;
    let objects = &env.state.objects;

    let data = Bytes::from_static(b"hello opal");
    let meta = objects
        .put_object("t1", "photos", "a.txt", data.clone(), None, HashMap::new())
        .await
        .unwrap();
    assert_eq!(meta.size, data.len() as u64);
    assert_eq!(meta.etag, compute_etag(&data));

    let (fetched, bytes) = objects.get_object("t1", "photos", "a.txt").await.unwrap();
    assert_eq!(fetched.etag, meta.etag);
    assert_eq!(bytes, data);

    objects.delete_object("t1", "photos", "a.txt").await.unwrap();
    assert!(matches!(
        objects.get_object("t1", "photos", "a.txt").await,
        Err(OpalError::NotFound(_))
    ));
}

#[tokio::test]
async fn usage_counter_tracks_puts_overwrites_and_deletes() {
    let env = setup().await;
    let objects = &env.state.objects;
    let store = &env.state.store;

    objects
        .put_object("t1", "photos", "a", Bytes::from(vec![0u8; 100]), None, HashMap::new())
        .await
        .unwrap();
    assert_eq!(store.tenant_usage_bytes("t1"), 100);

    // Overwrite replaces the old size rather than double counting.
    objects
        .put_object("t1", "photos", "a", Bytes::from(vec![0u8; 40]), None, HashMap::new())
        .await
        .unwrap();
    assert_eq!(store.tenant_usage_bytes("t1"), 40);

    objects.delete_object("t1", "photos", "a").await.unwrap();
    assert_eq!(store.tenant_usage_bytes("t1"), 0);
}

#[tokio::test]
async fn list_objects_pages_with_marker_and_prefix() {
    let env = setup().await;
    let objects = &env.state.objects;
    for key in ["2024/a", "2024/b", "2024/c", "2025/a"] {
        objects
            .put_object("t1", "photos", key, Bytes::from_static(b"x"), None, HashMap::new())
            .await
            .unwrap();
    }

    let page1 = objects.list_objects("t1", "photos", "2024/", "", 2).await.unwrap();
    assert_eq!(page1.objects.len(), 2);
    assert!(page1.truncated);
    let marker = page1.next_marker.clone().unwrap();

    let page2 = objects
        .list_objects("t1", "photos", "2024/", &marker, 2)
        .await
        .unwrap();
    assert_eq!(page2.objects.len(), 1);
    assert_eq!(page2.objects[0].key, "2024/c");
    assert!(page2.next_marker.is_none());
}

#[tokio::test]
async fn create_bucket_twice_conflicts() {
    let env = setup().await;
    let err = env
        .state
        .objects
        .create_bucket("t1", "photos")
        .await
        .unwrap_err();
    assert!(matches!(err, OpalError::Conflict(_)));
}

#[tokio::test]
async fn create_bucket_for_unknown_tenant_fails() {
    let env = setup().await;
    let err = env
        .state
        .objects
        .create_bucket("nobody", "b")
        .await
        .unwrap_err();
    assert!(matches!(err, OpalError::NotFound(_)));
}

#[tokio::test]
async fn non_empty_bucket_needs_force_to_delete() {
    let env = setup().await;
    let objects = &env.state.objects;
    objects
        .put_object("t1", "photos", "a", Bytes::from_static(b"x"), None, HashMap::new())
        .await
        .unwrap();

    assert!(matches!(
        objects.delete_bucket("t1", "photos", false).await,
        Err(OpalError::Conflict(_))
    ));
    objects.delete_bucket("t1", "photos", true).await.unwrap();
    assert!(!objects.owns_bucket("t1/photos").await);
    // The forced delete reclaimed the tenant counter.
    assert_eq!(env.state.store.tenant_usage_bytes("t1"), 0);
}

#[tokio::test]
async fn keys_with_awkward_characters_survive() {
    let env = setup().await;
    let objects = &env.state.objects;
    let key = "dir with spaces/αβγ/100%.bin";
    objects
        .put_object("t1", "photos", key, Bytes::from_static(b"data"), None, HashMap::new())
        .await
        .unwrap();
    let (meta, _) = objects.get_object("t1", "photos", key).await.unwrap();
    assert_eq!(meta.key, key);
}
