// tests/unit_notify_test.rs

//! Notification hub fan-out: tenant filtering, the global-admin-only
//! broadcast rule, and drop-oldest back-pressure on slow subscribers.

use opalstore::core::notify::{Notification, NotificationHub};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn event(kind: &str, tenant: Option<&str>) -> Notification {
    Notification::new(
        kind,
        tenant.map(|t| t.to_string()),
        "info",
        format!("title {kind}"),
        format!("message {kind}"),
    )
}

#[tokio::test]
async fn tenant_scoped_event_reaches_tenant_and_admin() {
    let hub = NotificationHub::new();
    let (_a, mut admin_rx) = hub.subscribe(None, true);
    let (_b, mut t1_rx) = hub.subscribe(Some("t1".to_string()), false);
    let (_c, mut t2_rx) = hub.subscribe(Some("t2".to_string()), false);

    let delivered = hub.publish(event("quota_alert", Some("t1")));
    assert_eq!(delivered, 2);
    assert_eq!(admin_rx.try_recv().unwrap().kind, "quota_alert");
    assert_eq!(t1_rx.try_recv().unwrap().kind, "quota_alert");
    assert!(matches!(t2_rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn unscoped_event_is_global_admin_only() {
    let hub = NotificationHub::new();
    let (_a, mut admin_rx) = hub.subscribe(None, true);
    let (_b, mut tenant_rx) = hub.subscribe(Some("t1".to_string()), false);

    let delivered = hub.publish(event("disk_alert", None));
    assert_eq!(delivered, 1);
    assert_eq!(admin_rx.try_recv().unwrap().kind, "disk_alert");
    assert!(matches!(tenant_rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn slow_subscriber_drops_oldest_entries() {
    let hub = NotificationHub::new();
    let (_id, mut rx) = hub.subscribe(None, true);

    // Overflow the per-subscriber buffer without draining it.
    for i in 0..100 {
        hub.publish(event(&format!("e{i}"), None));
    }
    match rx.recv().await {
        Err(RecvError::Lagged(missed)) => assert!(missed > 0),
        other => panic!("expected lag report, got {other:?}"),
    }
    // After the lag report, the oldest surviving entry is readable and the
    // newest entry was not lost.
    let first = rx.recv().await.unwrap();
    assert_ne!(first.kind, "e0");
}

#[tokio::test]
async fn unsubscribe_and_purge_remove_subscribers() {
    let hub = NotificationHub::new();
    let (id, rx) = hub.subscribe(None, true);
    assert_eq!(hub.subscriber_count(), 1);
    hub.unsubscribe(id);
    assert_eq!(hub.subscriber_count(), 0);
    drop(rx);

    let (_id, rx2) = hub.subscribe(Some("t1".to_string()), false);
    drop(rx2);
    assert_eq!(hub.purge_closed(), 1);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn publish_with_no_subscribers_is_harmless() {
    let hub = NotificationHub::new();
    assert_eq!(hub.publish(event("noop", None)), 0);
}
