// src/core/objects/store.rs

//! The object storage backend seam and its filesystem implementation.
//! Object bytes live under `<root>/<tenant>/<bucket>/data/`, with a JSON
//! metadata sidecar per object under `meta/`. Keys are percent-encoded so
//! arbitrary S3 keys map onto a single flat directory level.

use crate::core::entities::BucketInfo;
use crate::core::{OpalError, now_ms};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const BUCKET_MARKER: &str = ".bucket.json";

/// Stored metadata for one object version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// SHA-256 of the content, hex encoded. Recomputed by integrity scans.
    pub etag: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub version_id: Option<String>,
    pub created_at: i64,
}

/// One page of a marker-based object listing.
#[derive(Debug, Clone)]
pub struct ObjectPage {
    pub objects: Vec<ObjectMeta>,
    pub next_marker: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketMarker {
    tenant_id: String,
    name: String,
    created_at: i64,
}

/// The operations the core needs from an object storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn create_bucket(&self, tenant: &str, bucket: &str) -> Result<(), OpalError>;
    /// Creates the bucket if it does not exist yet. Used by replication and
    /// migration receivers.
    async fn ensure_bucket(&self, tenant: &str, bucket: &str) -> Result<(), OpalError>;
    /// Removes the bucket and everything in it.
    async fn delete_bucket(&self, tenant: &str, bucket: &str) -> Result<(), OpalError>;
    async fn bucket_exists(&self, tenant: &str, bucket: &str) -> bool;
    async fn list_buckets(&self, tenant: Option<&str>) -> Result<Vec<BucketInfo>, OpalError>;
    async fn put_object(
        &self,
        tenant: &str,
        bucket: &str,
        meta: ObjectMeta,
        data: Bytes,
    ) -> Result<Option<ObjectMeta>, OpalError>;
    async fn get_object(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(ObjectMeta, Bytes), OpalError>;
    async fn stat_object(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, OpalError>;
    async fn delete_object(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, OpalError>;
    async fn list_objects(
        &self,
        tenant: &str,
        bucket: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> Result<ObjectPage, OpalError>;
    /// Reads the raw bytes without touching the sidecar, for hash recomputation.
    async fn read_object_bytes(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Bytes>, OpalError>;
}

/// Filesystem-backed object store rooted at a configured directory.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, OpalError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, tenant: &str, bucket: &str) -> PathBuf {
        self.root
            .join(encode_segment(tenant))
            .join(encode_segment(bucket))
    }

    fn data_path(&self, tenant: &str, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(tenant, bucket)
            .join("data")
            .join(encode_segment(key))
    }

    fn meta_path(&self, tenant: &str, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(tenant, bucket)
            .join("meta")
            .join(format!("{}.json", encode_segment(key)))
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), OpalError> {
        // The suffix is appended, not substituted, so keys that differ only
        // in their final extension cannot share a temp path.
        let tmp = path.with_file_name(format!(
            "{}.tmp.write",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("object")
        ));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_marker(&self, tenant: &str, bucket: &str) -> Option<BucketMarker> {
        let path = self.bucket_dir(tenant, bucket).join(BUCKET_MARKER);
        let contents = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&contents).ok()
    }

    async fn bucket_stats(&self, tenant: &str, bucket: &str) -> (u64, u64) {
        let meta_dir = self.bucket_dir(tenant, bucket).join("meta");
        let mut count = 0u64;
        let mut bytes = 0u64;
        let Ok(mut entries) = tokio::fs::read_dir(&meta_dir).await else {
            return (0, 0);
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(contents) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            if let Ok(meta) = serde_json::from_slice::<ObjectMeta>(&contents) {
                count += 1;
                bytes += meta.size;
            }
        }
        (count, bytes)
    }
}

fn encode_segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

fn decode_segment(encoded: &str) -> String {
    urlencoding::decode(encoded)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| encoded.to_string())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn create_bucket(&self, tenant: &str, bucket: &str) -> Result<(), OpalError> {
        if self.bucket_exists(tenant, bucket).await {
            return Err(OpalError::Conflict(format!(
                "bucket '{tenant}/{bucket}' already exists"
            )));
        }
        self.ensure_bucket(tenant, bucket).await
    }

    async fn ensure_bucket(&self, tenant: &str, bucket: &str) -> Result<(), OpalError> {
        let dir = self.bucket_dir(tenant, bucket);
        tokio::fs::create_dir_all(dir.join("data")).await?;
        tokio::fs::create_dir_all(dir.join("meta")).await?;
        let marker_path = dir.join(BUCKET_MARKER);
        if !marker_path.exists() {
            let marker = BucketMarker {
                tenant_id: tenant.to_string(),
                name: bucket.to_string(),
                created_at: now_ms(),
            };
            Self::write_atomic(&marker_path, &serde_json::to_vec(&marker)?).await?;
        }
        Ok(())
    }

    async fn delete_bucket(&self, tenant: &str, bucket: &str) -> Result<(), OpalError> {
        let dir = self.bucket_dir(tenant, bucket);
        if !dir.exists() {
            return Err(OpalError::NotFound(format!(
                "no such bucket '{tenant}/{bucket}'"
            )));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn bucket_exists(&self, tenant: &str, bucket: &str) -> bool {
        self.bucket_dir(tenant, bucket).join(BUCKET_MARKER).exists()
    }

    async fn list_buckets(&self, tenant: Option<&str>) -> Result<Vec<BucketInfo>, OpalError> {
        let mut buckets = Vec::new();
        let mut tenants = tokio::fs::read_dir(&self.root).await?;
        while let Some(tenant_entry) = tenants.next_entry().await? {
            if !tenant_entry.file_type().await?.is_dir() {
                continue;
            }
            let tenant_name = decode_segment(&tenant_entry.file_name().to_string_lossy());
            if let Some(filter) = tenant {
                if tenant_name != filter {
                    continue;
                }
            }
            let mut bucket_dirs = tokio::fs::read_dir(tenant_entry.path()).await?;
            while let Some(bucket_entry) = bucket_dirs.next_entry().await? {
                if !bucket_entry.file_type().await?.is_dir() {
                    continue;
                }
                let bucket_name = decode_segment(&bucket_entry.file_name().to_string_lossy());
                let Some(marker) = self.read_marker(&tenant_name, &bucket_name).await else {
                    continue;
                };
                let (object_count, size_bytes) =
                    self.bucket_stats(&tenant_name, &bucket_name).await;
                buckets.push(BucketInfo {
                    name: marker.name,
                    tenant_id: marker.tenant_id,
                    object_count,
                    size_bytes,
                    created_at: marker.created_at,
                    node_id: String::new(),
                    node_name: String::new(),
                });
            }
        }
        buckets.sort_by(|a, b| (&a.tenant_id, &a.name).cmp(&(&b.tenant_id, &b.name)));
        Ok(buckets)
    }

    async fn put_object(
        &self,
        tenant: &str,
        bucket: &str,
        meta: ObjectMeta,
        data: Bytes,
    ) -> Result<Option<ObjectMeta>, OpalError> {
        if !self.bucket_exists(tenant, bucket).await {
            return Err(OpalError::NotFound(format!(
                "no such bucket '{tenant}/{bucket}'"
            )));
        }
        let previous = self.stat_object(tenant, bucket, &meta.key).await?;
        Self::write_atomic(&self.data_path(tenant, bucket, &meta.key), &data).await?;
        Self::write_atomic(
            &self.meta_path(tenant, bucket, &meta.key),
            &serde_json::to_vec(&meta)?,
        )
        .await?;
        Ok(previous)
    }

    async fn get_object(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(ObjectMeta, Bytes), OpalError> {
        let meta = self
            .stat_object(tenant, bucket, key)
            .await?
            .ok_or_else(|| OpalError::NotFound(format!("no such object '{key}'")))?;
        let data = tokio::fs::read(self.data_path(tenant, bucket, key)).await?;
        Ok((meta, Bytes::from(data)))
    }

    async fn stat_object(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, OpalError> {
        match tokio::fs::read(self.meta_path(tenant, bucket, key)).await {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMeta>, OpalError> {
        let Some(meta) = self.stat_object(tenant, bucket, key).await? else {
            return Ok(None);
        };
        for path in [
            self.meta_path(tenant, bucket, key),
            self.data_path(tenant, bucket, key),
        ] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(Some(meta))
    }

    async fn list_objects(
        &self,
        tenant: &str,
        bucket: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> Result<ObjectPage, OpalError> {
        let meta_dir = self.bucket_dir(tenant, bucket).join("meta");
        if !meta_dir.exists() {
            return Err(OpalError::NotFound(format!(
                "no such bucket '{tenant}/{bucket}'"
            )));
        }

        // Collect and sort keys so marker-based pagination is stable.
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&meta_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            let key = decode_segment(encoded);
            if key.starts_with(prefix) && key.as_str() > marker {
                keys.push(key);
            }
        }
        keys.sort();
        let truncated = keys.len() > max_keys;
        keys.truncate(max_keys);

        let mut objects = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(meta) = self.stat_object(tenant, bucket, key).await? {
                objects.push(meta);
            }
        }
        let next_marker = if truncated {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_marker,
            truncated,
        })
    }

    async fn read_object_bytes(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<Bytes>, OpalError> {
        match tokio::fs::read(self.data_path(tenant, bucket, key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
