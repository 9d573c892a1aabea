// src/core/state.rs

//! Defines the central `ServerState` struct, holding all shared server-wide
//! components, and the factory that wires them together at startup.

use crate::config::Config;
use crate::core::OpalError;
use crate::core::alerts::AlertManager;
use crate::core::cluster::aggregator::{BucketAggregator, QuotaAggregator};
use crate::core::cluster::client::PeerClient;
use crate::core::cluster::manager::ClusterManager;
use crate::core::cluster::migration::MigrationManager;
use crate::core::cluster::rate_limit::RateLimiter;
use crate::core::cluster::replication::{ReplicationManager, ReplicationTask};
use crate::core::cluster::router::LocationRouter;
use crate::core::cluster::rpc::NonceCache;
use crate::core::cluster::sync::SyncService;
use crate::core::integrity::IntegrityManager;
use crate::core::mailer::Mailer;
use crate::core::metastore::MetaStore;
use crate::core::notify::NotificationHub;
use crate::core::objects::{FsObjectStore, ObjectManager};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Contains the initialized state plus the channel receivers consumed once
/// by the task spawner.
pub struct ServerInit {
    pub state: Arc<ServerState>,
    /// Receives replication tasks produced by successful object writes.
    pub replication_task_rx: mpsc::Receiver<ReplicationTask>,
}

/// The central struct holding all shared, server-wide state. Wrapped in an
/// `Arc` and handed to every handler and background task.
#[derive(Debug)]
pub struct ServerState {
    /// The runtime configuration, mutable for dynamic tuning.
    pub config: Arc<Mutex<Config>>,
    pub store: Arc<MetaStore>,
    pub peers: Arc<PeerClient>,
    pub objects: Arc<ObjectManager>,
    pub cluster: Arc<ClusterManager>,
    pub router: Arc<LocationRouter>,
    pub buckets: Arc<BucketAggregator>,
    pub quota: Arc<QuotaAggregator>,
    pub replication: Arc<ReplicationManager>,
    pub migrations: Arc<MigrationManager>,
    pub integrity: Arc<IntegrityManager>,
    pub alerts: Arc<AlertManager>,
    pub hub: Arc<NotificationHub>,
    pub mailer: Arc<Mailer>,
    pub sync: Arc<SyncService>,
    /// Per-source-IP limiter for the internal cluster API.
    pub rate_limiter: Arc<RateLimiter>,
    /// Replay protection for signed inter-node requests.
    pub nonces: Arc<NonceCache>,
    /// The JWT signing secret for client sessions; replaced by the cluster's
    /// shared secret on join.
    pub jwt_secret: Arc<RwLock<String>>,
    /// A handle to the logging filter, allowing dynamic log level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

impl ServerState {
    /// Initializes every component from the configuration. This is the one
    /// place where the collaborator graph is wired together; nothing here is
    /// a process-global singleton.
    pub fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<ServerInit, OpalError> {
        let store = Arc::new(MetaStore::open(&config.data_dir)?);
        let peers = Arc::new(PeerClient::new(&config.cluster, store.clone()));
        let mailer = Arc::new(Mailer::new(&config.mailer));
        let hub = Arc::new(NotificationHub::new());
        let alerts = Arc::new(AlertManager::new(
            config.alerts.clone(),
            store.clone(),
            hub.clone(),
            mailer.clone(),
        ));
        let quota = Arc::new(QuotaAggregator::new(store.clone(), peers.clone()));

        let (replication_task_tx, replication_task_rx) =
            mpsc::channel(config.cluster.replication_queue_size);
        let backend = Arc::new(FsObjectStore::new(&config.storage_root)?);
        let objects = Arc::new(ObjectManager::new(
            store.clone(),
            backend,
            quota.clone(),
            alerts.clone(),
            replication_task_tx,
        ));

        let router = Arc::new(LocationRouter::new(
            store.clone(),
            peers.clone(),
            objects.clone(),
            config.cluster.location_cache_ttl,
        ));
        let buckets = Arc::new(BucketAggregator::new(
            store.clone(),
            peers.clone(),
            objects.clone(),
        ));
        let replication = Arc::new(ReplicationManager::new(
            &config.cluster,
            store.clone(),
            peers.clone(),
        ));
        let migrations = Arc::new(MigrationManager::new(
            store.clone(),
            peers.clone(),
            objects.clone(),
            router.clone(),
        ));
        let integrity = Arc::new(IntegrityManager::new(
            store.clone(),
            objects.clone(),
            hub.clone(),
            mailer.clone(),
            alerts.clone(),
            config.scrubber.manual_scan_cooldown,
        ));
        let sync = Arc::new(SyncService::new(store.clone(), peers.clone()));

        // The JWT secret survives restarts once adopted from a cluster; a
        // standalone node falls back to its configured or generated secret.
        let jwt_secret = ClusterManager::persisted_jwt_secret(&store)
            .or_else(|| config.jwt_secret.clone())
            .map(Ok)
            .unwrap_or_else(ClusterManager::generate_cluster_token)?;
        let jwt_secret = Arc::new(RwLock::new(jwt_secret));

        let node_name = config
            .node_name
            .clone()
            .unwrap_or_else(|| format!("opalstore-{}", config.api_port));
        let cluster = Arc::new(ClusterManager::new(
            store.clone(),
            peers.clone(),
            jwt_secret.clone(),
            config.advertised_endpoint(),
            node_name,
            config.region.clone(),
            config.cluster.failure_threshold,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.cluster.rate_limit_per_sec,
            config.cluster.rate_limit_burst,
        ));
        let nonces = Arc::new(NonceCache::new(config.cluster.clock_skew));

        info!("Server state initialized (data dir {:?}).", config.data_dir);
        let state = Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            store,
            peers,
            objects,
            cluster,
            router,
            buckets,
            quota,
            replication,
            migrations,
            integrity,
            alerts,
            hub,
            mailer,
            sync,
            rate_limiter,
            nonces,
            jwt_secret,
            log_reload_handle,
        });

        Ok(ServerInit {
            state,
            replication_task_rx,
        })
    }
}
