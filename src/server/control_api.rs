// src/server/control_api.rs

//! The client-facing cluster control API served on the console listener.
//! Authentication goes through the injected `AdminGate` seam; the bundled
//! gate validates a configured static bearer token, and deployments plug
//! their session validator into the same trait.

use super::envelope::ApiOk;
use crate::core::OpalError;
use crate::core::cluster::manager::{ClusterStatus, NodeUpdate};
use crate::core::cluster::replication::DeadLetter;
use crate::core::cluster::router::CacheStats;
use crate::core::entities::{
    BucketInfo, BucketReplicationRule, ClusterConfig, MigrationJob, Node,
};
use crate::core::integrity::{IntegrityHistoryEntry, ScanPage};
use crate::core::notify;
use crate::core::state::ServerState;
use async_trait::async_trait;
use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// The authenticated caller of a control API request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub tenant_id: Option<String>,
    pub is_global_admin: bool,
}

/// The authentication seam for the control API. The production deployment
/// wires the JWT/session validator in here.
#[async_trait]
pub trait AdminGate: Send + Sync + std::fmt::Debug {
    async fn authorize(&self, headers: &HeaderMap) -> Result<Principal, OpalError>;
}

/// Compares `Authorization: Bearer <token>` against a configured secret.
#[derive(Debug)]
pub struct StaticTokenGate {
    token: Option<String>,
}

impl StaticTokenGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AdminGate for StaticTokenGate {
    async fn authorize(&self, headers: &HeaderMap) -> Result<Principal, OpalError> {
        let Some(expected) = &self.token else {
            return Err(OpalError::Unauthorized(
                "admin API token is not configured".to_string(),
            ));
        };
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| OpalError::Unauthorized("missing bearer token".to_string()))?;
        if presented != expected {
            return Err(OpalError::Unauthorized("invalid admin token".to_string()));
        }
        Ok(Principal {
            subject: "admin".to_string(),
            tenant_id: None,
            is_global_admin: true,
        })
    }
}

#[derive(Clone)]
struct ControlState {
    state: Arc<ServerState>,
    gate: Arc<dyn AdminGate>,
}

/// Builds the control API router.
pub fn router(state: Arc<ServerState>, gate: Arc<dyn AdminGate>) -> Router {
    let control = ControlState { state, gate };
    Router::new()
        .route("/cluster/initialize", post(initialize))
        .route("/cluster/join", post(join))
        .route("/cluster/leave", post(leave))
        .route("/cluster/status", get(status))
        .route("/cluster/config", get(config))
        .route("/cluster/token", get(token))
        .route("/cluster/nodes", get(list_nodes).post(add_node))
        .route(
            "/cluster/nodes/{id}",
            get(get_node).put(update_node).delete(remove_node),
        )
        .route("/cluster/nodes/{id}/health", post(check_health))
        .route("/cluster/buckets", get(list_buckets))
        .route("/cluster/buckets/{bucket}/replicas", get(bucket_replicas))
        .route("/cluster/cache/stats", get(cache_stats))
        .route("/cluster/cache/invalidate", post(cache_invalidate))
        .route("/cluster/buckets/{bucket}/migrate", post(migrate_bucket))
        .route("/cluster/migrations", get(list_migrations))
        .route("/cluster/migrations/{id}", get(get_migration))
        .route(
            "/cluster/replication",
            get(list_replication).post(create_replication),
        )
        .route(
            "/cluster/replication/{id}",
            get(get_replication).put(update_replication).delete(delete_replication),
        )
        .route("/cluster/replication/bulk", post(bulk_replication))
        .route("/cluster/replication-dead-letters", get(dead_letters))
        .route("/buckets/{bucket}/verify-integrity", post(verify_integrity))
        .route("/buckets/{bucket}/integrity-status", get(integrity_status))
        .route("/cluster/events", get(events))
        .layer(middleware::from_fn_with_state(control.clone(), authorize))
        .with_state(control)
}

/// Rejects unauthenticated requests and stores the principal for handlers.
async fn authorize(
    State(control): State<ControlState>,
    mut request: Request,
    next: Next,
) -> Result<Response, OpalError> {
    let principal = control.gate.authorize(request.headers()).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

// --- Cluster lifecycle ---

#[derive(Serialize)]
struct InitializeResponse {
    cluster_token: String,
    node_id: String,
}

async fn initialize(
    State(control): State<ControlState>,
) -> Result<ApiOk<InitializeResponse>, OpalError> {
    let config = control.state.cluster.initialize_cluster()?;
    Ok(ApiOk(InitializeResponse {
        cluster_token: config.cluster_token,
        node_id: config.node_id,
    }))
}

#[derive(Deserialize)]
struct JoinRequest {
    cluster_token: String,
    node_endpoint: String,
}

async fn join(
    State(control): State<ControlState>,
    Json(body): Json<JoinRequest>,
) -> Result<ApiOk<ClusterStatus>, OpalError> {
    control
        .state
        .cluster
        .join_cluster(&body.cluster_token, &body.node_endpoint)
        .await?;
    Ok(ApiOk(control.state.cluster.status()))
}

async fn leave(State(control): State<ControlState>) -> Result<ApiOk<ClusterStatus>, OpalError> {
    control.state.cluster.leave_cluster()?;
    Ok(ApiOk(control.state.cluster.status()))
}

async fn status(State(control): State<ControlState>) -> ApiOk<ClusterStatus> {
    ApiOk(control.state.cluster.status())
}

/// The cluster config with the token redacted; `GET /cluster/token` exists
/// for the explicit retrieval.
#[derive(Serialize)]
struct ClusterConfigView {
    is_cluster_enabled: bool,
    node_id: String,
    node_name: String,
    region: String,
    created_at: i64,
}

impl From<ClusterConfig> for ClusterConfigView {
    fn from(config: ClusterConfig) -> Self {
        Self {
            is_cluster_enabled: config.is_cluster_enabled,
            node_id: config.node_id,
            node_name: config.node_name,
            region: config.region,
            created_at: config.created_at,
        }
    }
}

async fn config(
    State(control): State<ControlState>,
) -> Result<ApiOk<ClusterConfigView>, OpalError> {
    let config = control
        .state
        .store
        .cluster_config_snapshot()
        .ok_or(OpalError::NotInCluster)?;
    Ok(ApiOk(config.into()))
}

#[derive(Serialize)]
struct TokenResponse {
    cluster_token: String,
}

async fn token(State(control): State<ControlState>) -> Result<ApiOk<TokenResponse>, OpalError> {
    let cluster_token = control
        .state
        .store
        .cluster_token()
        .ok_or(OpalError::NotInCluster)?;
    Ok(ApiOk(TokenResponse { cluster_token }))
}

// --- Node CRUD ---

async fn list_nodes(State(control): State<ControlState>) -> ApiOk<Vec<Node>> {
    ApiOk(control.state.cluster.list_nodes())
}

#[derive(Deserialize)]
struct AddNodeRequest {
    node_endpoint: String,
    admin_token: String,
}

async fn add_node(
    State(control): State<ControlState>,
    Json(body): Json<AddNodeRequest>,
) -> Result<ApiOk<Vec<Node>>, OpalError> {
    control
        .state
        .cluster
        .add_node(&body.node_endpoint, &body.admin_token)
        .await?;
    Ok(ApiOk(control.state.cluster.list_nodes()))
}

async fn get_node(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> Result<ApiOk<Node>, OpalError> {
    Ok(ApiOk(control.state.cluster.get_node(&id)?))
}

async fn update_node(
    State(control): State<ControlState>,
    Path(id): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> Result<ApiOk<Node>, OpalError> {
    Ok(ApiOk(control.state.cluster.update_node(&id, update)?))
}

async fn remove_node(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> Result<ApiOk<Vec<Node>>, OpalError> {
    control.state.cluster.remove_node(&id)?;
    Ok(ApiOk(control.state.cluster.list_nodes()))
}

async fn check_health(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> Result<ApiOk<Node>, OpalError> {
    Ok(ApiOk(control.state.cluster.check_node_health(&id).await?))
}

// --- Aggregated reads & cache ---

#[derive(Deserialize)]
struct BucketsQuery {
    tenant_id: Option<String>,
}

async fn list_buckets(
    State(control): State<ControlState>,
    Query(query): Query<BucketsQuery>,
) -> Result<ApiOk<Vec<BucketInfo>>, OpalError> {
    let buckets = control
        .state
        .buckets
        .list_buckets(query.tenant_id.as_deref())
        .await?;
    Ok(ApiOk(buckets))
}

#[derive(Serialize)]
struct BucketReplica {
    node_id: String,
    node_name: String,
}

/// Every node that physically holds a copy of the bucket, discovered by a
/// live probe of self and all peers.
async fn bucket_replicas(
    State(control): State<ControlState>,
    Path(bucket): Path<String>,
) -> Result<ApiOk<Vec<BucketReplica>>, OpalError> {
    let state = &control.state;
    let mut replicas = Vec::new();
    if state.objects.owns_bucket(&bucket).await {
        let config = state.store.cluster_config_snapshot();
        replicas.push(BucketReplica {
            node_id: config
                .as_ref()
                .map(|c| c.node_id.clone())
                .unwrap_or_else(|| "local".to_string()),
            node_name: config
                .map(|c| c.node_name)
                .unwrap_or_else(|| "local".to_string()),
        });
    }
    for node in state.store.peer_nodes() {
        match state.peers.bucket_owner(&node.endpoint, &bucket).await {
            Ok(true) => replicas.push(BucketReplica {
                node_id: node.id,
                node_name: node.name,
            }),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                "Replica probe for '{}' on node '{}' failed: {}",
                bucket,
                node.id,
                e
            ),
        }
    }
    Ok(ApiOk(replicas))
}

async fn cache_stats(State(control): State<ControlState>) -> ApiOk<CacheStats> {
    ApiOk(control.state.router.stats())
}

#[derive(Deserialize)]
struct InvalidateRequest {
    bucket: String,
}

async fn cache_invalidate(
    State(control): State<ControlState>,
    Json(body): Json<InvalidateRequest>,
) -> Result<ApiOk<CacheStats>, OpalError> {
    control.state.router.invalidate(&body.bucket);
    Ok(ApiOk(control.state.router.stats()))
}

// --- Migration ---

#[derive(Deserialize)]
struct MigrateRequest {
    target_node_id: String,
    #[serde(default)]
    delete_source: bool,
    #[serde(default)]
    verify_data: bool,
}

async fn migrate_bucket(
    State(control): State<ControlState>,
    Path(bucket): Path<String>,
    Json(body): Json<MigrateRequest>,
) -> Result<ApiOk<MigrationJob>, OpalError> {
    let (tenant, bucket) = crate::core::objects::manager::split_bucket_path(&bucket)?;
    let job = control
        .state
        .migrations
        .start_migration(
            tenant,
            bucket,
            &body.target_node_id,
            body.delete_source,
            body.verify_data,
        )
        .await?;
    Ok(ApiOk(job))
}

async fn list_migrations(State(control): State<ControlState>) -> ApiOk<Vec<MigrationJob>> {
    ApiOk(control.state.migrations.list_jobs())
}

async fn get_migration(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> Result<ApiOk<MigrationJob>, OpalError> {
    Ok(ApiOk(control.state.migrations.get_job(&id)?))
}

// --- Replication rules ---

#[derive(Deserialize)]
struct ReplicationRuleRequest {
    tenant_id: String,
    source_bucket: String,
    destination_node_id: String,
    destination_bucket: String,
    #[serde(default = "default_rule_interval")]
    sync_interval_secs: u64,
    #[serde(default = "default_rule_enabled")]
    enabled: bool,
    #[serde(default)]
    replicate_deletes: bool,
    #[serde(default = "default_rule_enabled")]
    replicate_metadata: bool,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    priority: u8,
}

fn default_rule_interval() -> u64 {
    60
}
fn default_rule_enabled() -> bool {
    true
}

impl ReplicationRuleRequest {
    fn into_rule(self) -> BucketReplicationRule {
        BucketReplicationRule {
            id: String::new(),
            tenant_id: self.tenant_id,
            source_bucket: self.source_bucket,
            destination_node_id: self.destination_node_id,
            destination_bucket: self.destination_bucket,
            sync_interval_secs: self.sync_interval_secs,
            enabled: self.enabled,
            replicate_deletes: self.replicate_deletes,
            replicate_metadata: self.replicate_metadata,
            prefix: self.prefix,
            priority: self.priority,
            objects_replicated: 0,
            bytes_replicated: 0,
            last_sync_at: None,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

async fn list_replication(
    State(control): State<ControlState>,
) -> ApiOk<Vec<BucketReplicationRule>> {
    ApiOk(control.state.replication.list_rules())
}

async fn create_replication(
    State(control): State<ControlState>,
    Json(body): Json<ReplicationRuleRequest>,
) -> Result<ApiOk<BucketReplicationRule>, OpalError> {
    Ok(ApiOk(control.state.replication.create_rule(body.into_rule())?))
}

async fn get_replication(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> Result<ApiOk<BucketReplicationRule>, OpalError> {
    control
        .state
        .replication
        .get_rule(&id)
        .map(ApiOk)
        .ok_or_else(|| OpalError::NotFound(format!("no such replication rule '{id}'")))
}

async fn update_replication(
    State(control): State<ControlState>,
    Path(id): Path<String>,
    Json(body): Json<ReplicationRuleRequest>,
) -> Result<ApiOk<BucketReplicationRule>, OpalError> {
    Ok(ApiOk(
        control.state.replication.update_rule(&id, body.into_rule())?,
    ))
}

async fn delete_replication(
    State(control): State<ControlState>,
    Path(id): Path<String>,
) -> Result<ApiOk<Vec<BucketReplicationRule>>, OpalError> {
    control.state.replication.delete_rule(&id)?;
    Ok(ApiOk(control.state.replication.list_rules()))
}

#[derive(Deserialize)]
struct BulkReplicationRequest {
    rules: Vec<ReplicationRuleRequest>,
}

async fn bulk_replication(
    State(control): State<ControlState>,
    Json(body): Json<BulkReplicationRequest>,
) -> Result<ApiOk<Vec<BucketReplicationRule>>, OpalError> {
    let mut created = Vec::with_capacity(body.rules.len());
    for request in body.rules {
        created.push(control.state.replication.create_rule(request.into_rule())?);
    }
    Ok(ApiOk(created))
}

async fn dead_letters(State(control): State<ControlState>) -> ApiOk<Vec<DeadLetter>> {
    ApiOk(control.state.replication.dead_letters())
}

// --- Integrity ---

#[derive(Deserialize)]
struct VerifyIntegrityRequest {
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    marker: String,
    #[serde(default = "default_scan_page")]
    max_keys: usize,
}

fn default_scan_page() -> usize {
    500
}

async fn verify_integrity(
    State(control): State<ControlState>,
    Path(bucket): Path<String>,
    Json(body): Json<VerifyIntegrityRequest>,
) -> Result<ApiOk<ScanPage>, OpalError> {
    let page = control
        .state
        .integrity
        .manual_scan_page(&bucket, &body.prefix, &body.marker, body.max_keys)
        .await?;
    Ok(ApiOk(page))
}

async fn integrity_status(
    State(control): State<ControlState>,
    Path(bucket): Path<String>,
) -> ApiOk<Vec<IntegrityHistoryEntry>> {
    ApiOk(control.state.integrity.history(&bucket))
}

// --- Server-sent events ---

/// Streams notifications matching the caller's scope. Lagged subscribers
/// lose their oldest entries, which the hub counts as drops.
async fn events(
    State(control): State<ControlState>,
    axum::Extension(principal): axum::Extension<Principal>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (subscriber_id, mut rx) = control
        .state
        .hub
        .subscribe(principal.tenant_id.clone(), principal.is_global_admin);
    let hub = control.state.hub.clone();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let event = Event::default()
                        .event(notification.kind.clone())
                        .data(serde_json::to_string(&notification).unwrap_or_default());
                    yield Ok(event);
                }
                Err(RecvError::Lagged(missed)) => {
                    notify::record_dropped(missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        hub.unsubscribe(subscriber_id);
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
