// src/core/cluster/replication.rs

//! Asynchronous object replication. Client writes enqueue tasks; a worker
//! pool drains the queue and pushes objects to peer nodes, with exponential
//! backoff and a dead-letter list for tasks that exhaust their retries.

use crate::config::ClusterTuning;
use crate::core::cluster::client::PeerClient;
use crate::core::cluster::wire::ObjectPushMeta;
use crate::core::entities::BucketReplicationRule;
use crate::core::metastore::MetaStore;
use crate::core::objects::ObjectManager;
use crate::core::{OpalError, metrics, now_ms};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Base delay of the retry backoff; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(300);
/// A task is dead-lettered after this many failed attempts.
const MAX_ATTEMPTS: u32 = 3;
/// Dead letters kept in memory for operator inspection.
const DEAD_LETTER_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationOp {
    Put,
    Delete,
}

/// One unit of replication work, produced by a successful client write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub rule_id: String,
    pub key: String,
    pub op: ReplicationOp,
    pub priority: u8,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: ReplicationTask,
    pub error: String,
    pub failed_at: i64,
}

/// Owns the replication queue, retry schedule, dead letters, and rule CRUD.
#[derive(Debug)]
pub struct ReplicationManager {
    store: Arc<MetaStore>,
    peers: Arc<PeerClient>,
    queue: Mutex<VecDeque<ReplicationTask>>,
    notify: Notify,
    delayed: Mutex<Vec<(Instant, ReplicationTask)>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    capacity: usize,
    min_interval_secs: u64,
}

impl ReplicationManager {
    pub fn new(tuning: &ClusterTuning, store: Arc<MetaStore>, peers: Arc<PeerClient>) -> Self {
        Self {
            store,
            peers,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            delayed: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            capacity: tuning.replication_queue_size,
            min_interval_secs: tuning.min_replication_interval_secs,
        }
    }

    // --- Rule CRUD ---

    pub fn validate_rule(&self, rule: &BucketReplicationRule) -> Result<(), OpalError> {
        if rule.source_bucket.is_empty() || rule.destination_bucket.is_empty() {
            return Err(OpalError::Validation(
                "source and destination buckets are required".to_string(),
            ));
        }
        if self.store.local_node_id().as_deref() == Some(rule.destination_node_id.as_str()) {
            return Err(OpalError::Validation(
                "replication destination must not be the local node".to_string(),
            ));
        }
        if !self.store.nodes.contains_key(&rule.destination_node_id) {
            return Err(OpalError::NotFound(format!(
                "unknown destination node '{}'",
                rule.destination_node_id
            )));
        }
        if !self.store.tenants.contains_key(&rule.tenant_id) {
            return Err(OpalError::NotFound(format!(
                "unknown tenant '{}'",
                rule.tenant_id
            )));
        }
        if rule.sync_interval_secs < self.min_interval_secs {
            return Err(OpalError::Validation(format!(
                "sync interval must be at least {}s",
                self.min_interval_secs
            )));
        }
        Ok(())
    }

    pub fn create_rule(
        &self,
        mut rule: BucketReplicationRule,
    ) -> Result<BucketReplicationRule, OpalError> {
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        rule.created_at = now_ms();
        rule.updated_at = rule.created_at;
        self.validate_rule(&rule)?;
        if self.store.replication_rules.contains_key(&rule.id) {
            return Err(OpalError::Conflict(format!(
                "replication rule '{}' already exists",
                rule.id
            )));
        }
        self.store.replication_rules.insert(rule.id.clone(), rule.clone());
        self.store.mark_dirty();
        Ok(rule)
    }

    pub fn update_rule(
        &self,
        id: &str,
        mut rule: BucketReplicationRule,
    ) -> Result<BucketReplicationRule, OpalError> {
        let existing = self
            .store
            .replication_rules
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OpalError::NotFound(format!("no such replication rule '{id}'")))?;
        rule.id = existing.id.clone();
        rule.created_at = existing.created_at;
        rule.updated_at = now_ms();
        self.validate_rule(&rule)?;
        self.store.replication_rules.insert(existing.id, rule.clone());
        self.store.mark_dirty();
        Ok(rule)
    }

    pub fn delete_rule(&self, id: &str) -> Result<(), OpalError> {
        self.store
            .replication_rules
            .remove(id)
            .map(|_| self.store.mark_dirty())
            .ok_or_else(|| OpalError::NotFound(format!("no such replication rule '{id}'")))
    }

    pub fn get_rule(&self, id: &str) -> Option<BucketReplicationRule> {
        self.store.replication_rules.get(id).map(|e| e.value().clone())
    }

    pub fn list_rules(&self) -> Vec<BucketReplicationRule> {
        let mut rules: Vec<_> = self
            .store
            .replication_rules
            .iter()
            .map(|e| e.value().clone())
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rules
    }

    // --- Queue ---

    /// Inserts a task, letting higher-priority rules jump ahead of lower ones.
    pub fn enqueue(&self, task: ReplicationTask) -> Result<(), OpalError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(OpalError::Replication(
                "replication queue is full".to_string(),
            ));
        }
        let position = queue
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(queue.len());
        queue.insert(position, task);
        metrics::REPLICATION_QUEUE_DEPTH.set(queue.len() as f64);
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<ReplicationTask> {
        let mut queue = self.queue.lock();
        let task = queue.pop_front();
        metrics::REPLICATION_QUEUE_DEPTH.set(queue.len() as f64);
        task
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// Schedules a failed task for a retry after its backoff delay.
    fn schedule_retry(&self, task: ReplicationTask) {
        let exponent = task.attempt.saturating_sub(1).min(8);
        let base = RETRY_BASE * 2u32.pow(exponent);
        // Jitter spreads retries so a recovered peer is not hit by a burst.
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        let delay = base.mul_f64(jitter);
        debug!(
            "Scheduling retry {}/{} for rule '{}' key '{}' in {:?}.",
            task.attempt, MAX_ATTEMPTS, task.rule_id, task.key, delay
        );
        self.delayed.lock().push((Instant::now() + delay, task));
    }

    /// Moves due retries back onto the queue. Invoked by the dispatcher tick.
    fn promote_due_retries(&self) {
        let now = Instant::now();
        let due: Vec<ReplicationTask> = {
            let mut delayed = self.delayed.lock();
            let (ready, pending): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|(at, _)| *at <= now);
            *delayed = pending;
            ready.into_iter().map(|(_, task)| task).collect()
        };
        for task in due {
            if let Err(e) = self.enqueue(task) {
                warn!("Could not re-enqueue replication retry: {}", e);
            }
        }
    }

    fn dead_letter(&self, task: ReplicationTask, error: String) {
        metrics::REPLICATION_DEAD_LETTERS_TOTAL.inc();
        warn!(
            "Replication task for rule '{}' key '{}' dead-lettered after {} attempts: {}",
            task.rule_id, task.key, task.attempt, error
        );
        if let Some(mut rule) = self.store.replication_rules.get_mut(&task.rule_id) {
            rule.last_error = Some(error.clone());
            self.store.mark_dirty();
        }
        let mut letters = self.dead_letters.lock();
        letters.push(DeadLetter {
            task,
            error,
            failed_at: now_ms(),
        });
        let len = letters.len();
        if len > DEAD_LETTER_LIMIT {
            letters.drain(..len - DEAD_LETTER_LIMIT);
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    fn record_success(&self, rule_id: &str, bytes: u64) {
        if let Some(mut rule) = self.store.replication_rules.get_mut(rule_id) {
            rule.objects_replicated += 1;
            rule.bytes_replicated += bytes;
            rule.last_sync_at = Some(now_ms());
            rule.last_error = None;
            self.store.mark_dirty();
        }
        metrics::OBJECTS_REPLICATED_TOTAL.inc();
    }

    /// Executes one task against the destination node. `Ok(None)` means the
    /// task became moot (rule deleted/disabled, object gone) and no push
    /// happened.
    async fn process(
        &self,
        objects: &ObjectManager,
        task: &ReplicationTask,
    ) -> Result<Option<u64>, OpalError> {
        let Some(rule) = self.get_rule(&task.rule_id) else {
            return Ok(None);
        };
        if !rule.enabled {
            return Ok(None);
        }
        let destination = self
            .store
            .nodes
            .get(&rule.destination_node_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                OpalError::Replication(format!(
                    "destination node '{}' is no longer registered",
                    rule.destination_node_id
                ))
            })?;

        match task.op {
            ReplicationOp::Put => {
                let (meta, data) = match objects
                    .get_object(&rule.tenant_id, &rule.source_bucket, &task.key)
                    .await
                {
                    Ok(found) => found,
                    // The object was deleted after the task was enqueued.
                    Err(OpalError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(e),
                };
                let push = ObjectPushMeta {
                    size: meta.size,
                    etag: meta.etag.clone(),
                    content_type: meta.content_type.clone(),
                    metadata: if rule.replicate_metadata {
                        meta.metadata.clone()
                    } else {
                        Default::default()
                    },
                    source_version_id: meta.version_id.clone(),
                };
                self.peers
                    .push_object(
                        &destination.endpoint,
                        &rule.tenant_id,
                        &rule.destination_bucket,
                        &task.key,
                        data,
                        &push,
                    )
                    .await?;
                Ok(Some(meta.size))
            }
            ReplicationOp::Delete => {
                self.peers
                    .delete_object(
                        &destination.endpoint,
                        &rule.tenant_id,
                        &rule.destination_bucket,
                        &task.key,
                    )
                    .await?;
                Ok(Some(0))
            }
        }
    }
}

/// Feeds the priority queue from the write-side channel and promotes due
/// retries once a second.
pub struct ReplicationDispatcherTask {
    manager: Arc<ReplicationManager>,
    rx: mpsc::Receiver<ReplicationTask>,
}

impl ReplicationDispatcherTask {
    pub fn new(manager: Arc<ReplicationManager>, rx: mpsc::Receiver<ReplicationTask>) -> Self {
        Self { manager, rx }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Replication dispatcher started.");
        let mut retry_tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                Some(task) = self.rx.recv() => {
                    if let Err(e) = self.manager.enqueue(task) {
                        warn!("Dropping replication task: {}", e);
                    }
                }
                _ = retry_tick.tick() => {
                    self.manager.promote_due_retries();
                }
                _ = shutdown_rx.recv() => {
                    info!("Replication dispatcher shutting down.");
                    return;
                }
            }
        }
    }
}

/// One replication worker. The pool size is configured; each worker pulls
/// from the shared queue and executes tasks to completion.
pub struct ReplicationWorker {
    pub worker_id: usize,
    pub manager: Arc<ReplicationManager>,
    pub objects: Arc<ObjectManager>,
}

impl ReplicationWorker {
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Replication worker {} started.", self.worker_id);
        loop {
            let Some(mut task) = self.manager.pop() else {
                tokio::select! {
                    _ = self.manager.notify.notified() => continue,
                    _ = shutdown_rx.recv() => {
                        info!("Replication worker {} shutting down.", self.worker_id);
                        return;
                    }
                }
            };

            match self.manager.process(&self.objects, &task).await {
                Ok(Some(bytes)) => {
                    self.manager.record_success(&task.rule_id, bytes);
                }
                Ok(None) => {}
                Err(e) => {
                    task.attempt += 1;
                    if task.attempt < MAX_ATTEMPTS {
                        warn!(
                            "Replication attempt {} for rule '{}' key '{}' failed: {}",
                            task.attempt, task.rule_id, task.key, e
                        );
                        self.manager.schedule_retry(task);
                    } else {
                        self.manager.dead_letter(task, e.to_string());
                    }
                }
            }
        }
    }
}
