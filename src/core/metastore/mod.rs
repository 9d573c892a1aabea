// src/core/metastore/mod.rs

//! The embedded control-plane store. One authoritative set of typed tables
//! per node, held in memory and flushed as a single atomically-written JSON
//! image under the data directory.

pub mod persistence;

use crate::core::OpalError;
use crate::core::entities::{
    AccessKey, BucketAcl, BucketConfig, BucketPermission, BucketReplicationRule, ClusterConfig,
    EntityKind, IdpGroupMapping, IdpProvider, MigrationJob, Node, Replicated, Tenant, Tombstone,
    User,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::info;

/// File name of the persisted image inside the data directory.
const IMAGE_FILE: &str = "metastore.json";

/// The serialized on-disk form of the full store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetaImage {
    pub cluster_config: Option<ClusterConfig>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub access_keys: Vec<AccessKey>,
    #[serde(default)]
    pub bucket_permissions: Vec<BucketPermission>,
    #[serde(default)]
    pub bucket_acls: Vec<BucketAcl>,
    #[serde(default)]
    pub bucket_configs: Vec<BucketConfig>,
    #[serde(default)]
    pub idp_providers: Vec<IdpProvider>,
    #[serde(default)]
    pub idp_group_mappings: Vec<IdpGroupMapping>,
    #[serde(default)]
    pub replication_rules: Vec<BucketReplicationRule>,
    #[serde(default)]
    pub migrations: Vec<MigrationJob>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub kv: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tenant_usage: HashMap<String, u64>,
    #[serde(default)]
    pub watermarks: HashMap<EntityKind, i64>,
    #[serde(default)]
    pub last_local_write_at: i64,
}

/// The in-memory control-plane store. All mutating paths set the dirty flag
/// so the flush worker only rewrites the image when something changed.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    dirty: AtomicBool,
    /// Unix ms of the last local control-plane mutation. The stale
    /// reconciler compares this against the partition window.
    pub last_local_write_at: AtomicI64,
    pub cluster_config: RwLock<Option<ClusterConfig>>,
    pub nodes: DashMap<String, Node>,
    /// Keyed by `"{kind}:{id}"`.
    pub tombstones: DashMap<String, Tombstone>,
    pub tenants: DashMap<String, Tenant>,
    pub users: DashMap<String, User>,
    pub access_keys: DashMap<String, AccessKey>,
    pub bucket_permissions: DashMap<String, BucketPermission>,
    pub bucket_acls: DashMap<String, BucketAcl>,
    pub bucket_configs: DashMap<String, BucketConfig>,
    pub idp_providers: DashMap<String, IdpProvider>,
    pub idp_group_mappings: DashMap<String, IdpGroupMapping>,
    pub replication_rules: DashMap<String, BucketReplicationRule>,
    pub migrations: DashMap<String, MigrationJob>,
    pub settings: DashMap<String, String>,
    /// Arbitrary JSON values, e.g. integrity scan histories.
    pub kv: DashMap<String, serde_json::Value>,
    /// Authoritative local per-tenant storage byte counters.
    pub tenant_usage: DashMap<String, u64>,
    /// Per-entity-kind sync push watermarks (highest `updated_at` pushed).
    pub watermarks: DashMap<EntityKind, i64>,
}

impl MetaStore {
    /// Opens the store under `data_dir`, loading a previously flushed image
    /// when one exists.
    pub fn open(data_dir: &Path) -> Result<Self, OpalError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(IMAGE_FILE);
        let image = if path.exists() {
            let contents = std::fs::read(&path)?;
            let image: MetaImage = serde_json::from_slice(&contents)?;
            info!(
                "Loaded metastore image from {:?} ({} nodes, {} tenants, {} tombstones).",
                path,
                image.nodes.len(),
                image.tenants.len(),
                image.tombstones.len()
            );
            image
        } else {
            MetaImage::default()
        };
        Ok(Self::from_image(path, image))
    }

    fn from_image(path: PathBuf, image: MetaImage) -> Self {
        let store = Self {
            path,
            dirty: AtomicBool::new(false),
            last_local_write_at: AtomicI64::new(image.last_local_write_at),
            cluster_config: RwLock::new(image.cluster_config),
            nodes: image.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            tombstones: image
                .tombstones
                .into_iter()
                .map(|t| (Self::tombstone_key(t.entity_type, &t.entity_id), t))
                .collect(),
            tenants: image.tenants.into_iter().map(|r| (r.id.clone(), r)).collect(),
            users: image.users.into_iter().map(|r| (r.id.clone(), r)).collect(),
            access_keys: image
                .access_keys
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            bucket_permissions: image
                .bucket_permissions
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            bucket_acls: image
                .bucket_acls
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            bucket_configs: image
                .bucket_configs
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            idp_providers: image
                .idp_providers
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            idp_group_mappings: image
                .idp_group_mappings
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            replication_rules: image
                .replication_rules
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            migrations: image
                .migrations
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            settings: image.settings.into_iter().collect(),
            kv: image.kv.into_iter().collect(),
            tenant_usage: image.tenant_usage.into_iter().collect(),
            watermarks: image.watermarks.into_iter().collect(),
        };
        store
    }

    /// Builds the serializable image of the current state.
    pub fn to_image(&self) -> MetaImage {
        MetaImage {
            cluster_config: self.cluster_config.read().clone(),
            nodes: self.nodes.iter().map(|e| e.value().clone()).collect(),
            tombstones: self.tombstones.iter().map(|e| e.value().clone()).collect(),
            tenants: self.tenants.iter().map(|e| e.value().clone()).collect(),
            users: self.users.iter().map(|e| e.value().clone()).collect(),
            access_keys: self.access_keys.iter().map(|e| e.value().clone()).collect(),
            bucket_permissions: self
                .bucket_permissions
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            bucket_acls: self.bucket_acls.iter().map(|e| e.value().clone()).collect(),
            bucket_configs: self
                .bucket_configs
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            idp_providers: self
                .idp_providers
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            idp_group_mappings: self
                .idp_group_mappings
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            replication_rules: self
                .replication_rules
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            migrations: self.migrations.iter().map(|e| e.value().clone()).collect(),
            settings: self
                .settings
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            kv: self
                .kv
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            tenant_usage: self
                .tenant_usage
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            watermarks: self
                .watermarks
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            last_local_write_at: self.last_local_write_at.load(Ordering::Relaxed),
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.path
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears and returns the dirty flag. Used by the flush worker to skip
    /// cycles with no changes.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Records a local control-plane write for the stale reconciler.
    pub fn touch_local_write(&self, now_ms: i64) {
        self.last_local_write_at.store(now_ms, Ordering::Relaxed);
        self.mark_dirty();
    }

    pub fn tombstone_key(kind: EntityKind, id: &str) -> String {
        format!("{kind}:{id}")
    }

    pub fn tombstone_for(&self, kind: EntityKind, id: &str) -> Option<Tombstone> {
        self.tombstones
            .get(&Self::tombstone_key(kind, id))
            .map(|e| e.value().clone())
    }

    pub fn put_tombstone(&self, tombstone: Tombstone) {
        let key = Self::tombstone_key(tombstone.entity_type, &tombstone.entity_id);
        self.tombstones.insert(key, tombstone);
        self.mark_dirty();
    }

    pub fn watermark(&self, kind: EntityKind) -> i64 {
        self.watermarks.get(&kind).map(|e| *e.value()).unwrap_or(0)
    }

    pub fn set_watermark(&self, kind: EntityKind, value: i64) {
        self.watermarks.insert(kind, value);
        self.mark_dirty();
    }

    // --- Cluster config helpers ---

    pub fn cluster_config_snapshot(&self) -> Option<ClusterConfig> {
        self.cluster_config.read().clone()
    }

    pub fn is_cluster_enabled(&self) -> bool {
        self.cluster_config
            .read()
            .as_ref()
            .is_some_and(|c| c.is_cluster_enabled)
    }

    pub fn local_node_id(&self) -> Option<String> {
        self.cluster_config.read().as_ref().map(|c| c.node_id.clone())
    }

    pub fn cluster_token(&self) -> Option<String> {
        self.cluster_config
            .read()
            .as_ref()
            .map(|c| c.cluster_token.clone())
    }

    /// Peers of the local node, i.e. all known nodes minus ourselves.
    pub fn peer_nodes(&self) -> Vec<Node> {
        let local = self.local_node_id();
        self.nodes
            .iter()
            .filter(|e| local.as_deref() != Some(e.key().as_str()))
            .map(|e| e.value().clone())
            .collect()
    }

    // --- Tenant usage counters ---

    pub fn tenant_usage_bytes(&self, tenant_id: &str) -> u64 {
        self.tenant_usage
            .get(tenant_id)
            .map(|e| *e.value())
            .unwrap_or(0)
    }

    pub fn add_tenant_usage(&self, tenant_id: &str, delta: u64) -> u64 {
        let mut entry = self.tenant_usage.entry(tenant_id.to_string()).or_insert(0);
        *entry += delta;
        let new = *entry;
        drop(entry);
        self.mark_dirty();
        new
    }

    pub fn sub_tenant_usage(&self, tenant_id: &str, delta: u64) -> u64 {
        let mut entry = self.tenant_usage.entry(tenant_id.to_string()).or_insert(0);
        *entry = entry.saturating_sub(delta);
        let new = *entry;
        drop(entry);
        self.mark_dirty();
        new
    }
}

/// Typed access to one replicated entity table. The generic sync engine is
/// written against this trait and wired once per entity kind below.
pub trait EntityStore<T: Replicated> {
    fn get_entity(&self, id: &str) -> Option<T>;
    fn upsert_entity(&self, row: T);
    fn remove_entity(&self, id: &str) -> Option<T>;
    fn all_entities(&self) -> Vec<T>;
}

macro_rules! impl_entity_store {
    ($ty:ty, $table:ident) => {
        impl EntityStore<$ty> for MetaStore {
            fn get_entity(&self, id: &str) -> Option<$ty> {
                self.$table.get(id).map(|e| e.value().clone())
            }
            fn upsert_entity(&self, row: $ty) {
                self.$table.insert(row.id().to_string(), row);
                self.mark_dirty();
            }
            fn remove_entity(&self, id: &str) -> Option<$ty> {
                let removed = self.$table.remove(id).map(|(_, v)| v);
                if removed.is_some() {
                    self.mark_dirty();
                }
                removed
            }
            fn all_entities(&self) -> Vec<$ty> {
                self.$table.iter().map(|e| e.value().clone()).collect()
            }
        }
    };
}

impl_entity_store!(Tenant, tenants);
impl_entity_store!(User, users);
impl_entity_store!(AccessKey, access_keys);
impl_entity_store!(BucketPermission, bucket_permissions);
impl_entity_store!(BucketAcl, bucket_acls);
impl_entity_store!(BucketConfig, bucket_configs);
impl_entity_store!(IdpProvider, idp_providers);
impl_entity_store!(IdpGroupMapping, idp_group_mappings);
