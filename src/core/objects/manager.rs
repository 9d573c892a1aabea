// src/core/objects/manager.rs

//! The `ObjectManager` is the only path to the object storage backend. It
//! owns the per-tenant storage counters, performs quota admission, computes
//! content ETags, feeds the replication queue on successful writes, and
//! recomputes hashes for integrity scans.

use crate::core::cluster::aggregator::QuotaAggregator;
use crate::core::cluster::replication::{ReplicationOp, ReplicationTask};
use crate::core::cluster::wire::ObjectPushMeta;
use crate::core::entities::BucketInfo;
use crate::core::integrity::{CheckOutcome, IntegrityIssue, ScanPage};
use crate::core::metastore::MetaStore;
use crate::core::objects::store::{ObjectMeta, ObjectPage, ObjectStore};
use crate::core::{OpalError, now_ms};
use crate::core::alerts::AlertManager;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ObjectManager {
    store: Arc<MetaStore>,
    backend: Arc<dyn ObjectStore>,
    quota: Arc<QuotaAggregator>,
    alerts: Arc<AlertManager>,
    repl_tx: mpsc::Sender<ReplicationTask>,
}

/// Content ETag: SHA-256 of the body, hex encoded.
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Splits a `tenant/bucket` path into its two segments.
pub fn split_bucket_path(bucket_path: &str) -> Result<(&str, &str), OpalError> {
    bucket_path
        .split_once('/')
        .filter(|(t, b)| !t.is_empty() && !b.is_empty())
        .ok_or_else(|| {
            OpalError::Validation(format!(
                "bucket path '{bucket_path}' must be '<tenant>/<bucket>'"
            ))
        })
}

impl ObjectManager {
    pub fn new(
        store: Arc<MetaStore>,
        backend: Arc<dyn ObjectStore>,
        quota: Arc<QuotaAggregator>,
        alerts: Arc<AlertManager>,
        repl_tx: mpsc::Sender<ReplicationTask>,
    ) -> Self {
        Self {
            store,
            backend,
            quota,
            alerts,
            repl_tx,
        }
    }

    // --- Buckets ---

    pub async fn create_bucket(&self, tenant_id: &str, bucket: &str) -> Result<(), OpalError> {
        let tenant = self
            .store
            .tenants
            .get(tenant_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OpalError::NotFound(format!("unknown tenant '{tenant_id}'")))?;
        if !tenant.enabled {
            return Err(OpalError::Validation(format!(
                "tenant '{tenant_id}' is disabled"
            )));
        }
        if tenant.max_buckets > 0 {
            let local = self.backend.list_buckets(Some(tenant_id)).await?.len() as u32;
            if local >= tenant.max_buckets {
                return Err(OpalError::Validation(format!(
                    "tenant '{tenant_id}' has reached its bucket limit ({})",
                    tenant.max_buckets
                )));
            }
        }
        self.backend.create_bucket(tenant_id, bucket).await
    }

    /// Deletes a bucket. Without `force`, a non-empty bucket is refused;
    /// migration cleanup passes `force` to drop objects with it.
    pub async fn delete_bucket(
        &self,
        tenant_id: &str,
        bucket: &str,
        force: bool,
    ) -> Result<(), OpalError> {
        if !force {
            let page = self
                .backend
                .list_objects(tenant_id, bucket, "", "", 1)
                .await?;
            if !page.objects.is_empty() {
                return Err(OpalError::Conflict(format!(
                    "bucket '{tenant_id}/{bucket}' is not empty"
                )));
            }
        }
        // Reclaim the counter for whatever is being dropped.
        let (count, bytes) = self.bucket_usage(tenant_id, bucket).await;
        self.backend.delete_bucket(tenant_id, bucket).await?;
        if bytes > 0 {
            self.store.sub_tenant_usage(tenant_id, bytes);
        }
        debug!(
            "Deleted bucket '{}/{}' ({} objects, {} bytes).",
            tenant_id, bucket, count, bytes
        );
        Ok(())
    }

    async fn bucket_usage(&self, tenant_id: &str, bucket: &str) -> (u64, u64) {
        self.backend
            .list_buckets(Some(tenant_id))
            .await
            .ok()
            .and_then(|buckets| {
                buckets
                    .into_iter()
                    .find(|b| b.name == bucket)
                    .map(|b| (b.object_count, b.size_bytes))
            })
            .unwrap_or((0, 0))
    }

    pub async fn list_local_buckets(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<Vec<BucketInfo>, OpalError> {
        self.backend.list_buckets(tenant_id).await
    }

    /// Whether this node physically holds the bucket path.
    pub async fn owns_bucket(&self, bucket_path: &str) -> bool {
        let Ok((tenant, bucket)) = split_bucket_path(bucket_path) else {
            return false;
        };
        self.backend.bucket_exists(tenant, bucket).await
    }

    // --- Client-facing object writes ---

    /// Stores an object for a client write: quota admission first, then the
    /// backend write, counter update, replication enqueue, and the tenant
    /// quota escalator.
    pub async fn put_object(
        &self,
        tenant_id: &str,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectMeta, OpalError> {
        self.quota.check_write(tenant_id, data.len() as u64).await?;

        let versioning = self
            .store
            .bucket_configs
            .get(&format!("{tenant_id}/{bucket}"))
            .map(|e| e.value().versioning)
            .unwrap_or(false);
        let meta = ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
            etag: compute_etag(&data),
            content_type,
            metadata,
            version_id: versioning.then(|| uuid::Uuid::new_v4().to_string()),
            created_at: now_ms(),
        };
        let previous = self
            .backend
            .put_object(tenant_id, bucket, meta.clone(), data)
            .await?;

        if let Some(prev) = &previous {
            self.store.sub_tenant_usage(tenant_id, prev.size);
        }
        let usage = self.store.add_tenant_usage(tenant_id, meta.size);
        self.enqueue_replication(tenant_id, bucket, key, ReplicationOp::Put);

        if let Some(tenant) = self.store.tenants.get(tenant_id).map(|e| e.value().clone()) {
            self.alerts
                .evaluate_tenant_quota(tenant_id, usage, tenant.max_storage_bytes)
                .await;
        }
        Ok(meta)
    }

    pub async fn delete_object(
        &self,
        tenant_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(), OpalError> {
        let removed = self.backend.delete_object(tenant_id, bucket, key).await?;
        let Some(meta) = removed else {
            return Err(OpalError::NotFound(format!("no such object '{key}'")));
        };
        self.store.sub_tenant_usage(tenant_id, meta.size);
        self.enqueue_replication(tenant_id, bucket, key, ReplicationOp::Delete);
        Ok(())
    }

    pub async fn get_object(
        &self,
        tenant_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(ObjectMeta, Bytes), OpalError> {
        self.backend.get_object(tenant_id, bucket, key).await
    }

    pub async fn stat_object(
        &self,
        tenant_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, OpalError> {
        self.backend.stat_object(tenant_id, bucket, key).await
    }

    pub async fn list_objects(
        &self,
        tenant_id: &str,
        bucket: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> Result<ObjectPage, OpalError> {
        self.backend
            .list_objects(tenant_id, bucket, prefix, marker, max_keys)
            .await
    }

    // --- Peer-driven object writes (replication / migration receivers) ---

    /// Applies an object pushed by a peer. Quota admission was performed at
    /// the origin, and the write is not re-enqueued for replication, which
    /// keeps two-way rules from ping-ponging objects.
    pub async fn apply_replicated_put(
        &self,
        tenant_id: &str,
        bucket: &str,
        key: &str,
        data: Bytes,
        push: &ObjectPushMeta,
    ) -> Result<(), OpalError> {
        let actual_etag = compute_etag(&data);
        if actual_etag != push.etag {
            return Err(OpalError::Integrity(format!(
                "pushed object '{key}' arrived with etag {actual_etag}, expected {}",
                push.etag
            )));
        }
        self.backend.ensure_bucket(tenant_id, bucket).await?;
        let meta = ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
            etag: push.etag.clone(),
            content_type: push.content_type.clone(),
            metadata: push.metadata.clone(),
            version_id: push.source_version_id.clone(),
            created_at: now_ms(),
        };
        let previous = self
            .backend
            .put_object(tenant_id, bucket, meta.clone(), data)
            .await?;
        if let Some(prev) = previous {
            self.store.sub_tenant_usage(tenant_id, prev.size);
        }
        self.store.add_tenant_usage(tenant_id, meta.size);
        Ok(())
    }

    pub async fn apply_replicated_delete(
        &self,
        tenant_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(), OpalError> {
        if let Some(meta) = self.backend.delete_object(tenant_id, bucket, key).await? {
            self.store.sub_tenant_usage(tenant_id, meta.size);
        }
        Ok(())
    }

    fn enqueue_replication(&self, tenant_id: &str, bucket: &str, key: &str, op: ReplicationOp) {
        let local_node = self.store.local_node_id();
        for entry in self.store.replication_rules.iter() {
            let rule = entry.value();
            if !rule.enabled
                || rule.tenant_id != tenant_id
                || rule.source_bucket != bucket
                || !key.starts_with(&rule.prefix)
            {
                continue;
            }
            if local_node.as_deref() == Some(rule.destination_node_id.as_str()) {
                continue;
            }
            if op == ReplicationOp::Delete && !rule.replicate_deletes {
                continue;
            }
            let task = ReplicationTask {
                rule_id: rule.id.clone(),
                key: key.to_string(),
                op,
                priority: rule.priority,
                attempt: 0,
            };
            if let Err(e) = self.repl_tx.try_send(task) {
                warn!(
                    "Replication queue full; dropping task for rule '{}' key '{}': {}",
                    rule.id, key, e
                );
            }
        }
    }

    // --- Integrity verification ---

    /// Verifies one page of a bucket: recomputes each object's content hash
    /// and compares it with the stored ETag.
    pub async fn verify_bucket_integrity(
        &self,
        bucket_path: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> Result<ScanPage, OpalError> {
        let (tenant, bucket) = split_bucket_path(bucket_path)?;
        let listing = self
            .backend
            .list_objects(tenant, bucket, prefix, marker, max_keys)
            .await?;

        let mut page = ScanPage {
            next_marker: listing.next_marker.clone(),
            ..Default::default()
        };
        for meta in listing.objects {
            page.checked += 1;
            match self.backend.read_object_bytes(tenant, bucket, &meta.key).await {
                Ok(Some(data)) => {
                    let actual = compute_etag(&data);
                    if actual == meta.etag {
                        page.ok += 1;
                    } else {
                        page.corrupted += 1;
                        page.issues.push(IntegrityIssue {
                            key: meta.key.clone(),
                            outcome: CheckOutcome::Corrupted,
                            expected_etag: meta.etag.clone(),
                            actual_etag: Some(actual),
                            detail: "content hash does not match stored etag".to_string(),
                        });
                    }
                }
                Ok(None) => {
                    page.missing += 1;
                    page.issues.push(IntegrityIssue {
                        key: meta.key.clone(),
                        outcome: CheckOutcome::Missing,
                        expected_etag: meta.etag.clone(),
                        actual_etag: None,
                        detail: "object bytes are gone from the backend".to_string(),
                    });
                }
                Err(e) => {
                    page.errors += 1;
                    page.issues.push(IntegrityIssue {
                        key: meta.key.clone(),
                        outcome: CheckOutcome::Error,
                        expected_etag: meta.etag.clone(),
                        actual_etag: None,
                        detail: format!("failed to read object: {e}"),
                    });
                }
            }
        }
        Ok(page)
    }
}
