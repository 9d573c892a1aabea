// tests/unit_integrity_test.rs

//! Integrity machinery: hash verification, scan history caps, and the
//! manual-scan cooldown.

#[path = "integration/test_helpers.rs"]
mod test_helpers;
#[path = "integration/fixtures.rs"]
mod fixtures;

use bytes::Bytes;
use fixtures::tenant;
use opalstore::OpalError;
use opalstore::core::integrity::{CheckOutcome, ScanPage, ScanSource};
use std::collections::HashMap;
use test_helpers::{TestEnv, new_env};

async fn setup() -> TestEnv {
    let env = new_env();
    env.state.cluster.initialize_cluster().unwrap();
    env.state.sync.upsert_local(tenant("t1", 0));
    env.state.objects.create_bucket("t1", "docs").await.unwrap();
    env
}

async fn put(env: &TestEnv, key: &str, body: &[u8]) {
    env.state
        .objects
        .put_object("t1", "docs", key, Bytes::copy_from_slice(body), None, HashMap::new())
        .await
        .unwrap();
}

/// Flips bytes of the stored object behind the manager's back.
fn corrupt_on_disk(env: &TestEnv, key: &str) {
    let encoded = urlencoding::encode(key).into_owned();
    let path = env
        .storage_path()
        .join("t1")
        .join("docs")
        .join("data")
        .join(encoded);
    std::fs::write(path, b"silently different bytes").unwrap();
}

#[tokio::test]
async fn intact_objects_verify_clean() {
    let env = setup().await;
    put(&env, "a", b"alpha").await;
    put(&env, "b", b"beta").await;

    let page = env
        .state
        .objects
        .verify_bucket_integrity("t1/docs", "", "", 100)
        .await
        .unwrap();
    assert_eq!(page.checked, 2);
    assert_eq!(page.ok, 2);
    assert_eq!(page.corrupted, 0);
    assert!(page.issues.is_empty());
}

#[tokio::test]
async fn flipped_bytes_are_reported_corrupted() {
    let env = setup().await;
    put(&env, "a", b"alpha").await;
    corrupt_on_disk(&env, "a");

    let page = env
        .state
        .objects
        .verify_bucket_integrity("t1/docs", "", "", 100)
        .await
        .unwrap();
    assert_eq!(page.corrupted, 1);
    assert_eq!(page.issues.len(), 1);
    assert_eq!(page.issues[0].outcome, CheckOutcome::Corrupted);
    assert!(page.issues[0].actual_etag.is_some());
}

#[tokio::test]
async fn missing_blob_is_reported_missing() {
    let env = setup().await;
    put(&env, "a", b"alpha").await;
    let encoded = urlencoding::encode("a").into_owned();
    std::fs::remove_file(
        env.storage_path()
            .join("t1")
            .join("docs")
            .join("data")
            .join(encoded),
    )
    .unwrap();

    let page = env
        .state
        .objects
        .verify_bucket_integrity("t1/docs", "", "", 100)
        .await
        .unwrap();
    assert_eq!(page.missing, 1);
    assert_eq!(page.issues[0].outcome, CheckOutcome::Missing);
}

#[tokio::test]
async fn manual_scan_appends_history_and_enforces_cooldown() {
    let env = setup().await;
    put(&env, "a", b"alpha").await;

    let page = env
        .state
        .integrity
        .manual_scan_page("t1/docs", "", "", 100)
        .await
        .unwrap();
    assert_eq!(page.checked, 1);

    let history = env.state.integrity.history("t1/docs");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, ScanSource::Manual);
    assert_eq!(history[0].checked, 1);

    // A second fresh scan within the cooldown window is rate limited.
    let err = env
        .state
        .integrity
        .manual_scan_page("t1/docs", "", "", 100)
        .await
        .unwrap_err();
    assert!(matches!(err, OpalError::RateLimited(_)));
}

#[tokio::test]
async fn continuation_pages_bypass_the_cooldown() {
    let env = setup().await;
    for i in 0..3 {
        put(&env, &format!("k{i}"), b"body").await;
    }

    // First page starts the scan and leaves a next marker.
    let first = env
        .state
        .integrity
        .manual_scan_page("t1/docs", "", "", 2)
        .await
        .unwrap();
    let marker = first.next_marker.clone().expect("truncated page");

    // The continuation runs immediately, no cooldown involved.
    let second = env
        .state
        .integrity
        .manual_scan_page("t1/docs", "", &marker, 2)
        .await
        .unwrap();
    assert!(second.next_marker.is_none());

    // One completed scan, with totals merged across both pages.
    let history = env.state.integrity.history("t1/docs");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].checked, 3);
}

#[tokio::test]
async fn history_is_capped_at_ten_entries() {
    let env = setup().await;
    for i in 0..15 {
        env.state
            .integrity
            .record_scrub("t1/docs", 1000 + i, ScanPage::default());
    }
    let history = env.state.integrity.history("t1/docs");
    assert_eq!(history.len(), 10);
    // Newest first.
    assert_eq!(history[0].scanned_at, 1014);
}
