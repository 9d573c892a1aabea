// tests/unit_alerts_test.rs

//! Alert escalator dedup: only upward transitions fire, and a dip followed
//! by a re-cross of an already-fired threshold stays silent.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use opalstore::core::alerts::AlertLevel;
use test_helpers::new_env;

#[tokio::test]
async fn warning_then_critical_fires_twice_only() {
    let env = new_env();
    let alerts = &env.state.alerts;

    // Readings: cross warning, cross critical, drop, re-cross warning.
    assert_eq!(alerts.evaluate_disk(81).await, Some(AlertLevel::Warning));
    assert_eq!(alerts.evaluate_disk(91).await, Some(AlertLevel::Critical));
    assert_eq!(alerts.evaluate_disk(40).await, None);
    assert_eq!(alerts.evaluate_disk(85).await, None);
}

#[tokio::test]
async fn repeated_same_level_is_suppressed() {
    let env = new_env();
    let alerts = &env.state.alerts;

    assert_eq!(alerts.evaluate_disk(82).await, Some(AlertLevel::Warning));
    assert_eq!(alerts.evaluate_disk(83).await, None);
    assert_eq!(alerts.evaluate_disk(84).await, None);
}

#[tokio::test]
async fn below_warning_never_fires() {
    let env = new_env();
    assert_eq!(env.state.alerts.evaluate_disk(10).await, None);
    assert_eq!(env.state.alerts.evaluate_disk(79).await, None);
}

#[tokio::test]
async fn tenant_quota_levels_are_deduplicated_per_tenant() {
    let env = new_env();
    let alerts = &env.state.alerts;
    let max = 100;

    assert_eq!(
        alerts.evaluate_tenant_quota("t1", 85, max).await,
        Some(AlertLevel::Warning)
    );
    assert_eq!(alerts.evaluate_tenant_quota("t1", 86, max).await, None);
    assert_eq!(
        alerts.evaluate_tenant_quota("t1", 95, max).await,
        Some(AlertLevel::Critical)
    );
    // Another tenant escalates independently.
    assert_eq!(
        alerts.evaluate_tenant_quota("t2", 85, max).await,
        Some(AlertLevel::Warning)
    );
}

#[tokio::test]
async fn unlimited_quota_never_alerts() {
    let env = new_env();
    assert_eq!(
        env.state.alerts.evaluate_tenant_quota("t1", 500, 0).await,
        None
    );
}

#[tokio::test]
async fn cleared_tenant_can_fire_again() {
    let env = new_env();
    let alerts = &env.state.alerts;
    assert_eq!(
        alerts.evaluate_tenant_quota("t1", 85, 100).await,
        Some(AlertLevel::Warning)
    );
    alerts.clear_tenant("t1");
    assert_eq!(
        alerts.evaluate_tenant_quota("t1", 85, 100).await,
        Some(AlertLevel::Warning)
    );
}
