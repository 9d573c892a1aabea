// tests/integration/fixtures.rs

//! Reusable builders for control-plane entities used across tests.

use opalstore::core::entities::{AccessKey, Node, NodeHealth, Tenant, User, UserRole};
use opalstore::core::now_ms;

#[allow(dead_code)]
pub const GIB: u64 = 1024 * 1024 * 1024;

#[allow(dead_code)]
pub fn tenant(id: &str, max_storage_bytes: u64) -> Tenant {
    let now = now_ms();
    Tenant {
        id: id.to_string(),
        name: format!("tenant {id}"),
        max_storage_bytes,
        max_buckets: 0,
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

/// A tenant row with an explicit logical timestamp, for LWW scenarios.
#[allow(dead_code)]
pub fn tenant_at(id: &str, updated_at: i64) -> Tenant {
    Tenant {
        updated_at,
        created_at: updated_at,
        ..tenant(id, 0)
    }
}

#[allow(dead_code)]
pub fn global_admin(id: &str, email: &str) -> User {
    let now = now_ms();
    User {
        id: id.to_string(),
        tenant_id: None,
        username: format!("admin-{id}"),
        email: email.to_string(),
        password_hash: "argon2-hash-placeholder".to_string(),
        role: UserRole::GlobalAdmin,
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

#[allow(dead_code)]
pub fn tenant_user(id: &str, tenant_id: &str, updated_at: i64) -> User {
    User {
        id: id.to_string(),
        tenant_id: Some(tenant_id.to_string()),
        username: format!("user-{id}"),
        email: format!("{id}@example.com"),
        password_hash: "argon2-hash-placeholder".to_string(),
        role: UserRole::Member,
        enabled: true,
        created_at: updated_at,
        updated_at,
    }
}

/// A healthy peer row, for tests that need a known remote node without a
/// live listener behind it.
#[allow(dead_code)]
pub fn peer_node(id: &str, endpoint: &str) -> Node {
    Node {
        id: id.to_string(),
        name: format!("node {id}"),
        endpoint: endpoint.to_string(),
        region: "test-region".to_string(),
        health_status: NodeHealth::Healthy,
        last_heartbeat_at: now_ms(),
        bucket_count: 0,
        last_local_write_at: 0,
        consecutive_failures: 0,
    }
}

#[allow(dead_code)]
pub fn access_key(id: &str, user_id: &str, updated_at: i64) -> AccessKey {
    AccessKey {
        id: id.to_string(),
        user_id: user_id.to_string(),
        access_key_id: format!("AK{id}"),
        secret_key_hash: "secret-hash-placeholder".to_string(),
        enabled: true,
        created_at: updated_at,
        updated_at,
    }
}
