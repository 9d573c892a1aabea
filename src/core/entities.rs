// src/core/entities.rs

//! Control-plane entity definitions: cluster membership records and the
//! replicated entities that flow between peers under Last-Writer-Wins.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use strum_macros::{Display, EnumIter, EnumString};

/// The health of a peer as observed by the local health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// A member of the cluster. The row for the local node is owned exclusively
/// by this node; peer rows are updated by the health checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// Base URL under which the node's API listener is reachable.
    pub endpoint: String,
    pub region: String,
    pub health_status: NodeHealth,
    /// Unix milliseconds of the last successful health probe.
    pub last_heartbeat_at: i64,
    pub bucket_count: u64,
    /// Unix milliseconds of the last local control-plane write, consulted by
    /// the stale reconciler to pick between offline and partition merge modes.
    pub last_local_write_at: i64,
    /// Consecutive probe failures. Runtime bookkeeping, not replicated.
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// The singleton cluster configuration record for this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub is_cluster_enabled: bool,
    pub node_id: String,
    pub node_name: String,
    /// High-entropy shared secret. HMAC key for the inter-node RPC plane and
    /// the credential for the join handshake.
    pub cluster_token: String,
    pub region: String,
    pub created_at: i64,
}

/// The kinds of entities replicated between peers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Tenant,
    User,
    AccessKey,
    BucketPermission,
    BucketAcl,
    BucketConfig,
    IdpProvider,
    IdpGroupMapping,
}

/// A durable record that an entity was deleted. Suppresses resurrection by
/// late sync payloads whose `updated_at` does not exceed `deleted_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub deleted_at: i64,
    pub deleted_by_node: String,
}

/// Implemented by every entity that participates in LWW state sync.
pub trait Replicated:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;
    fn id(&self) -> &str;
    fn updated_at(&self) -> i64;
}

macro_rules! impl_replicated {
    ($ty:ty, $kind:expr) => {
        impl Replicated for $ty {
            const KIND: EntityKind = $kind;
            fn id(&self) -> &str {
                &self.id
            }
            fn updated_at(&self) -> i64 {
                self.updated_at
            }
        }
    };
}

/// The role a user holds within a tenant, or globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    GlobalAdmin,
    TenantAdmin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub max_storage_bytes: u64,
    pub max_buckets: u32,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// `None` marks a global administrator not scoped to any tenant.
    pub tenant_id: Option<String>,
    pub username: String,
    pub email: String,
    /// Hashed by the auth layer before the row ever reaches the sync plane.
    pub password_hash: String,
    pub role: UserRole,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn is_global_admin(&self) -> bool {
        self.role == UserRole::GlobalAdmin && self.tenant_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub id: String,
    pub user_id: String,
    pub access_key_id: String,
    pub secret_key_hash: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The access level a bucket permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BucketAccess {
    Read,
    ReadWrite,
    Owner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketPermission {
    pub id: String,
    pub tenant_id: String,
    pub bucket: String,
    pub user_id: String,
    pub access: BucketAccess,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclGrant {
    pub grantee: String,
    pub permission: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketAcl {
    /// Keyed by bucket path, so the id is the bucket itself.
    pub id: String,
    pub grants: Vec<AclGrant>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub id: String,
    pub prefix: String,
    pub expiration_days: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsRule {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_seconds: u32,
}

/// Per-bucket configuration replicated across the cluster and transferred
/// wholesale during bucket migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Keyed by bucket path.
    pub id: String,
    pub versioning: bool,
    pub object_lock: bool,
    pub encryption: bool,
    #[serde(default)]
    pub lifecycle: Vec<LifecycleRule>,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    #[serde(default)]
    pub cors: Vec<CorsRule>,
    /// Bucket policy as a raw JSON document.
    #[serde(default)]
    pub policy: Option<String>,
    /// Notification target configuration as a raw JSON document.
    #[serde(default)]
    pub notification: Option<String>,
    /// Inventory report configuration as a raw JSON document, consumed by
    /// the inventory worker.
    #[serde(default)]
    pub inventory: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IdpKind {
    Oidc,
    Ldap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpProvider {
    pub id: String,
    pub kind: IdpKind,
    pub display_name: String,
    /// Provider-specific settings as a raw JSON document; parsed by the
    /// out-of-scope identity layer.
    pub config_json: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpGroupMapping {
    pub id: String,
    pub provider_id: String,
    pub group_name: String,
    pub tenant_id: String,
    pub role: UserRole,
    pub created_at: i64,
    pub updated_at: i64,
}

impl_replicated!(Tenant, EntityKind::Tenant);
impl_replicated!(User, EntityKind::User);
impl_replicated!(AccessKey, EntityKind::AccessKey);
impl_replicated!(BucketPermission, EntityKind::BucketPermission);
impl_replicated!(BucketAcl, EntityKind::BucketAcl);
impl_replicated!(BucketConfig, EntityKind::BucketConfig);
impl_replicated!(IdpProvider, EntityKind::IdpProvider);
impl_replicated!(IdpGroupMapping, EntityKind::IdpGroupMapping);

/// A rule describing asynchronous object replication from a local bucket to
/// a bucket on a peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketReplicationRule {
    pub id: String,
    pub tenant_id: String,
    pub source_bucket: String,
    pub destination_node_id: String,
    pub destination_bucket: String,
    pub sync_interval_secs: u64,
    pub enabled: bool,
    pub replicate_deletes: bool,
    pub replicate_metadata: bool,
    /// Only keys with this prefix are replicated. Empty matches everything.
    #[serde(default)]
    pub prefix: String,
    /// Higher priority rules jump the replication queue.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub objects_replicated: u64,
    #[serde(default)]
    pub bytes_replicated: u64,
    #[serde(default)]
    pub last_sync_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The lifecycle of a bucket migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MigrationState {
    Pending,
    Copying,
    Verifying,
    CuttingOver,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: String,
    pub tenant_id: String,
    pub source_node: String,
    pub target_node: String,
    pub bucket: String,
    pub delete_source: bool,
    pub verify_data: bool,
    pub state: MigrationState,
    pub objects_total: u64,
    pub objects_copied: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl MigrationJob {
    /// A migration holds its per-bucket exclusivity while in one of these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            MigrationState::Pending
                | MigrationState::Copying
                | MigrationState::Verifying
                | MigrationState::CuttingOver
        )
    }
}

/// A bucket as reported by a single node, tagged with its residence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub tenant_id: String,
    pub object_count: u64,
    pub size_bytes: u64,
    pub created_at: i64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
}
