// src/core/cluster/wire.rs

//! Wire DTOs shared by the internal cluster API handlers and the peer
//! client, so both sides of every inter-node call agree on one schema.

use crate::core::entities::{
    BucketAcl, BucketConfig, BucketPermission, EntityKind, Node, Tombstone,
};
use serde::{Deserialize, Serialize};

/// The JSON envelope every API response is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }
}

/// Empty payload for endpoints that only signal success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {}

/// Join handshake, step 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateTokenRequest {
    pub cluster_token: String,
}

/// Join handshake, step 2. The joining node presents itself; the receiver
/// answers with its full node list so the joiner learns every peer at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub cluster_token: String,
    pub node: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub nodes: Vec<Node>,
    pub region: String,
}

/// The outcome reported for an applied sync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Inserted,
    Updated,
    SkippedLww,
    SkippedTombstone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub outcome: SyncOutcome,
}

/// Tombstone propagation payload for `<kind>-delete-sync` endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSyncRequest {
    pub entity_id: String,
    pub deleted_at: i64,
    pub deleted_by_node: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
    /// The local row is newer than the tombstone, so it survives.
    EntityWins,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSyncResponse {
    pub outcome: DeleteOutcome,
}

/// One replicated entity table inside a full-state snapshot, serialized as
/// raw JSON rows so the snapshot container stays kind-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTable {
    pub kind: EntityKind,
    pub rows: Vec<serde_json::Value>,
}

/// The full local replicated state plus tombstones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub node_id: String,
    pub taken_at: i64,
    pub tables: Vec<SnapshotTable>,
    pub tombstones: Vec<Tombstone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStorageResponse {
    pub tenant_id: String,
    pub current_storage_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketOwnershipResponse {
    pub bucket: String,
    pub owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidateRequest {
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSecretResponse {
    pub jwt_secret: String,
}

/// Migration transfer: all permissions of one bucket in a single call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketPermissionsTransfer {
    pub bucket: String,
    pub permissions: Vec<BucketPermission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketAclTransfer {
    pub acl: BucketAcl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfigTransfer {
    pub config: BucketConfig,
}

/// Metadata accompanying a replicated or migrated object push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPushMeta {
    pub size: u64,
    pub etag: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub source_version_id: Option<String>,
}

/// Remote object metadata returned by the stat endpoint, used by migration
/// verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStatResponse {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// The URL path slug for an entity kind, e.g. `access-key` for
/// `EntityKind::AccessKey` (endpoint `/access-key-sync`).
pub fn kind_slug(kind: EntityKind) -> String {
    kind.to_string().replace('_', "-")
}
