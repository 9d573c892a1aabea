// src/core/cluster/migration.rs

//! Live bucket migration between nodes: copy objects and bucket metadata to
//! the target, optionally verify, invalidate routing cluster-wide, and
//! finally delete or roll back.

use crate::core::cluster::client::PeerClient;
use crate::core::cluster::router::LocationRouter;
use crate::core::cluster::wire::ObjectPushMeta;
use crate::core::entities::{MigrationJob, MigrationState};
use crate::core::metastore::MetaStore;
use crate::core::objects::ObjectManager;
use crate::core::{OpalError, now_ms};
use std::sync::Arc;
use tokio::sync::{Notify, broadcast};
use tracing::{error, info, warn};

/// Objects copied per listing page.
const MIGRATION_PAGE_SIZE: usize = 500;

#[derive(Debug)]
pub struct MigrationManager {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    objects: Arc<ObjectManager>,
    router: Arc<LocationRouter>,
    wake: Notify,
}

impl MigrationManager {
    pub fn new(
        store: Arc<MetaStore>,
        peers: Arc<PeerClient>,
        objects: Arc<ObjectManager>,
        router: Arc<LocationRouter>,
    ) -> Self {
        Self {
            store,
            peers,
            objects,
            router,
            wake: Notify::new(),
        }
    }

    /// Validates and enqueues a migration job. Only one active migration per
    /// bucket is allowed at any time.
    pub async fn start_migration(
        &self,
        tenant_id: &str,
        bucket: &str,
        target_node_id: &str,
        delete_source: bool,
        verify_data: bool,
    ) -> Result<MigrationJob, OpalError> {
        let local_id = self.store.local_node_id().ok_or(OpalError::NotInCluster)?;
        if target_node_id == local_id {
            return Err(OpalError::Validation(
                "migration target must be a different node".to_string(),
            ));
        }
        if !self.store.nodes.contains_key(target_node_id) {
            return Err(OpalError::NotFound(format!(
                "unknown target node '{target_node_id}'"
            )));
        }
        let bucket_path = format!("{tenant_id}/{bucket}");
        if !self.objects.owns_bucket(&bucket_path).await {
            return Err(OpalError::NotFound(format!(
                "bucket '{bucket_path}' does not live on this node"
            )));
        }
        let already_active = self
            .store
            .migrations
            .iter()
            .any(|e| e.value().bucket == bucket_path && e.value().is_active());
        if already_active {
            return Err(OpalError::Conflict(format!(
                "a migration for bucket '{bucket_path}' is already running"
            )));
        }

        let (objects_total, bytes_total) = self
            .objects
            .list_local_buckets(Some(tenant_id))
            .await?
            .into_iter()
            .find(|b| b.name == bucket)
            .map(|b| (b.object_count, b.size_bytes))
            .unwrap_or((0, 0));

        let job = MigrationJob {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            source_node: local_id,
            target_node: target_node_id.to_string(),
            bucket: bucket_path,
            delete_source,
            verify_data,
            state: MigrationState::Pending,
            objects_total,
            objects_copied: 0,
            bytes_total,
            bytes_copied: 0,
            error: None,
            started_at: now_ms(),
            finished_at: None,
        };
        self.store.migrations.insert(job.id.clone(), job.clone());
        self.store.mark_dirty();
        self.wake.notify_one();
        info!(
            "Migration '{}' queued: bucket '{}' -> node '{}'.",
            job.id, job.bucket, job.target_node
        );
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<MigrationJob, OpalError> {
        self.store
            .migrations
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OpalError::NotFound(format!("no such migration '{id}'")))
    }

    pub fn list_jobs(&self) -> Vec<MigrationJob> {
        let mut jobs: Vec<_> = self
            .store
            .migrations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    fn transition(&self, job_id: &str, state: MigrationState) {
        if let Some(mut job) = self.store.migrations.get_mut(job_id) {
            info!(
                "Migration '{}' ({}): {} -> {}.",
                job_id, job.bucket, job.state, state
            );
            job.state = state;
            if !job.is_active() {
                job.finished_at = Some(now_ms());
            }
            drop(job);
            self.store.mark_dirty();
        }
    }

    fn record_progress(&self, job_id: &str, objects: u64, bytes: u64) {
        if let Some(mut job) = self.store.migrations.get_mut(job_id) {
            job.objects_copied = objects;
            job.bytes_copied = bytes;
        }
    }

    fn fail(&self, job_id: &str, error: &OpalError) {
        if let Some(mut job) = self.store.migrations.get_mut(job_id) {
            job.error = Some(error.to_string());
        }
        self.transition(job_id, MigrationState::Failed);
    }

    fn next_pending(&self) -> Option<MigrationJob> {
        self.store
            .migrations
            .iter()
            .filter(|e| e.value().state == MigrationState::Pending)
            .map(|e| e.value().clone())
            .min_by_key(|job| job.started_at)
    }

    /// Runs one job through the whole state machine.
    async fn execute(&self, job: MigrationJob) {
        let target = match self.store.nodes.get(&job.target_node).map(|e| e.value().clone()) {
            Some(node) => node,
            None => {
                self.fail(
                    &job.id,
                    &OpalError::NotFound(format!("target node '{}' vanished", job.target_node)),
                );
                return;
            }
        };
        let (tenant, bucket) = match job.bucket.split_once('/') {
            Some(parts) => parts,
            None => {
                self.fail(
                    &job.id,
                    &OpalError::Validation(format!("malformed bucket path '{}'", job.bucket)),
                );
                return;
            }
        };

        if let Err(e) = self.copy_phase(&job, &target.endpoint, tenant, bucket).await {
            error!("Migration '{}' failed while copying: {}", job.id, e);
            self.fail(&job.id, &e);
            self.rollback(&job, &target.endpoint, tenant, bucket).await;
            return;
        }

        if job.verify_data {
            self.transition(&job.id, MigrationState::Verifying);
            if let Err(e) = self.verify_phase(&job, &target.endpoint, tenant, bucket).await {
                error!("Migration '{}' failed verification: {}", job.id, e);
                self.fail(&job.id, &e);
                self.rollback(&job, &target.endpoint, tenant, bucket).await;
                return;
            }
        }

        // Cutover: the cluster-wide cache invalidation is deliberately the
        // last externally observable step of this phase.
        self.transition(&job.id, MigrationState::CuttingOver);
        self.router.invalidate_cluster_wide(&job.bucket).await;

        self.transition(&job.id, MigrationState::Completed);
        if job.delete_source {
            if let Err(e) = self.objects.delete_bucket(tenant, bucket, true).await {
                warn!(
                    "Migration '{}' completed but source cleanup failed: {}",
                    job.id, e
                );
            } else {
                self.router.invalidate(&job.bucket);
            }
        }
        info!("Migration '{}' completed.", job.id);
    }

    /// Streams every object page to the target, then the bucket's
    /// permissions, ACL, and configuration.
    async fn copy_phase(
        &self,
        job: &MigrationJob,
        target_endpoint: &str,
        tenant: &str,
        bucket: &str,
    ) -> Result<(), OpalError> {
        self.transition(&job.id, MigrationState::Copying);
        let mut marker = String::new();
        let mut objects_copied = 0u64;
        let mut bytes_copied = 0u64;

        loop {
            let page = self
                .objects
                .list_objects(tenant, bucket, "", &marker, MIGRATION_PAGE_SIZE)
                .await?;
            for meta in &page.objects {
                let (meta, data) = self.objects.get_object(tenant, bucket, &meta.key).await?;
                let push = ObjectPushMeta {
                    size: meta.size,
                    etag: meta.etag.clone(),
                    content_type: meta.content_type.clone(),
                    metadata: meta.metadata.clone(),
                    source_version_id: meta.version_id.clone(),
                };
                self.peers
                    .push_object(target_endpoint, tenant, bucket, &meta.key, data, &push)
                    .await?;
                objects_copied += 1;
                bytes_copied += meta.size;
                self.record_progress(&job.id, objects_copied, bytes_copied);
            }
            match page.next_marker {
                Some(next) => marker = next,
                None => break,
            }
        }

        let permissions: Vec<_> = self
            .store
            .bucket_permissions
            .iter()
            .filter(|e| e.value().tenant_id == tenant && e.value().bucket == bucket)
            .map(|e| e.value().clone())
            .collect();
        if !permissions.is_empty() {
            self.peers
                .transfer_permissions(target_endpoint, &job.bucket, permissions)
                .await?;
        }
        if let Some(acl) = self.store.bucket_acls.get(&job.bucket).map(|e| e.value().clone()) {
            self.peers.transfer_acl(target_endpoint, acl).await?;
        }
        if let Some(config) = self
            .store
            .bucket_configs
            .get(&job.bucket)
            .map(|e| e.value().clone())
        {
            self.peers.transfer_config(target_endpoint, config).await?;
        }
        Ok(())
    }

    /// Compares ETag and size of every object on both sides.
    async fn verify_phase(
        &self,
        job: &MigrationJob,
        target_endpoint: &str,
        tenant: &str,
        bucket: &str,
    ) -> Result<(), OpalError> {
        let mut marker = String::new();
        loop {
            let page = self
                .objects
                .list_objects(tenant, bucket, "", &marker, MIGRATION_PAGE_SIZE)
                .await?;
            for meta in &page.objects {
                let remote = self
                    .peers
                    .stat_object(target_endpoint, tenant, bucket, &meta.key)
                    .await?
                    .ok_or_else(|| {
                        OpalError::Migration(format!(
                            "object '{}' missing on target after copy",
                            meta.key
                        ))
                    })?;
                if remote.etag != meta.etag || remote.size != meta.size {
                    return Err(OpalError::Migration(format!(
                        "object '{}' differs on target (etag {} vs {}, size {} vs {})",
                        meta.key, remote.etag, meta.etag, remote.size, meta.size
                    )));
                }
            }
            match page.next_marker {
                Some(next) => marker = next,
                None => return Ok(()),
            }
        }
    }

    /// Best-effort removal of the partial state copied to the target.
    async fn rollback(
        &self,
        job: &MigrationJob,
        target_endpoint: &str,
        tenant: &str,
        bucket: &str,
    ) {
        match self
            .peers
            .delete_remote_bucket(target_endpoint, tenant, bucket)
            .await
        {
            Ok(()) => self.transition(&job.id, MigrationState::RolledBack),
            Err(e) => warn!(
                "Migration '{}' rollback could not clean the target: {}",
                job.id, e
            ),
        }
    }
}

/// Drains pending migration jobs one at a time.
pub struct MigrationRunnerTask {
    manager: Arc<MigrationManager>,
}

impl MigrationRunnerTask {
    pub fn new(manager: Arc<MigrationManager>) -> Self {
        Self { manager }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Migration runner started.");
        loop {
            let Some(job) = self.manager.next_pending() else {
                tokio::select! {
                    _ = self.manager.wake.notified() => continue,
                    _ = shutdown_rx.recv() => {
                        info!("Migration runner shutting down.");
                        return;
                    }
                }
            };
            self.manager.execute(job).await;
        }
    }
}
