// src/server/internal_api.rs

//! The internal cluster HTTP API mounted under `/cluster/internal`. Every
//! endpoint except the join handshake and the health probe sits behind the
//! per-IP rate limiter and the HMAC verification middleware.

use super::envelope::ApiOk;
use crate::core::OpalError;
use crate::core::cluster::rpc::{
    self, HDR_NODE_ID, HDR_NONCE, HDR_SIGNATURE, HDR_TIMESTAMP, SignedHeaders,
};
use crate::core::cluster::snapshot::{build_snapshot, import_snapshot};
use crate::core::cluster::sync::{apply_incoming, apply_incoming_delete};
use crate::core::cluster::wire::{
    Ack, BucketAclTransfer, BucketConfigTransfer, BucketOwnershipResponse,
    BucketPermissionsTransfer, CacheInvalidateRequest, DeleteSyncRequest, DeleteSyncResponse,
    JwtSecretResponse, ObjectPushMeta, ObjectStatResponse, RegisterNodeRequest,
    RegisterNodeResponse, StateSnapshot, SyncResponse, TenantStorageResponse,
    ValidateTokenRequest,
};
use crate::core::entities::{
    AccessKey, BucketAcl, BucketConfig, BucketInfo, BucketPermission, IdpGroupMapping,
    IdpProvider, Node, Replicated, Tenant, User,
};
use crate::core::state::ServerState;
use axum::body::{Body, Bytes as BodyBytes};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// The authenticated source node of a signed request, injected into request
/// extensions by the verification middleware.
#[derive(Debug, Clone)]
pub struct SourceNode(pub String);

/// Builds the internal API router.
pub fn router(state: Arc<ServerState>) -> Router {
    // The join handshake authenticates with the cluster token itself, and
    // the health probe is deliberately open.
    let unsigned = Router::new()
        .route("/validate-token", post(validate_token))
        .route("/register-node", post(register_node))
        .route("/nodes", get(list_nodes_with_token))
        .route("/health", get(health));

    let signed = Router::new()
        .route("/state-snapshot", get(get_snapshot).post(receive_snapshot))
        .route("/tenant-sync", post(sync_entity::<Tenant>))
        .route("/user-sync", post(sync_entity::<User>))
        .route("/access-key-sync", post(sync_entity::<AccessKey>))
        .route("/bucket-permission-sync", post(sync_entity::<BucketPermission>))
        .route("/bucket-acl-sync", post(sync_entity::<BucketAcl>))
        .route("/bucket-config-sync", post(sync_entity::<BucketConfig>))
        .route("/idp-provider-sync", post(sync_entity::<IdpProvider>))
        .route("/idp-group-mapping-sync", post(sync_entity::<IdpGroupMapping>))
        .route("/tenant-delete-sync", post(delete_sync::<Tenant>))
        .route("/user-delete-sync", post(delete_sync::<User>))
        .route("/access-key-delete-sync", post(delete_sync::<AccessKey>))
        .route(
            "/bucket-permission-delete-sync",
            post(delete_sync::<BucketPermission>),
        )
        .route("/bucket-acl-delete-sync", post(delete_sync::<BucketAcl>))
        .route("/bucket-config-delete-sync", post(delete_sync::<BucketConfig>))
        .route("/idp-provider-delete-sync", post(delete_sync::<IdpProvider>))
        .route(
            "/idp-group-mapping-delete-sync",
            post(delete_sync::<IdpGroupMapping>),
        )
        .route("/bucket-permissions", post(receive_permissions))
        .route("/bucket-acl", post(receive_acl))
        .route("/bucket-config", post(receive_config))
        .route(
            "/objects/{tenant}/{bucket}/{key}",
            put(receive_object).delete(delete_object).get(stat_object),
        )
        .route("/buckets", get(list_local_buckets))
        .route("/buckets/{tenant}/{bucket}", axum::routing::delete(delete_bucket))
        .route("/tenant/{id}/storage", get(tenant_storage))
        .route("/bucket-owner/{bucket}", get(bucket_owner))
        .route("/cache-invalidate", post(cache_invalidate))
        .route("/jwt-secret", get(jwt_secret))
        .layer(middleware::from_fn_with_state(state.clone(), verify_hmac));

    Router::new()
        .merge(unsigned)
        .merge(signed)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

/// Sheds excess per-IP traffic before any signature work happens.
async fn rate_limit(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Result<Response, OpalError> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        if !state.rate_limiter.check(addr.ip()) {
            return Err(OpalError::RateLimited("too many requests".to_string()));
        }
    }
    Ok(next.run(request).await)
}

/// Buffers the body, verifies the HMAC header set against it, and injects
/// the authenticated source node for the handlers.
async fn verify_hmac(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Result<Response, OpalError> {
    let token = state.store.cluster_token().ok_or(OpalError::NotInCluster)?;

    let headers = request.headers();
    let read_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| OpalError::Unauthorized(format!("missing {name} header")))
    };
    let signed = SignedHeaders {
        node_id: read_header(HDR_NODE_ID)?,
        timestamp: read_header(HDR_TIMESTAMP)?
            .parse()
            .map_err(|_| OpalError::Unauthorized("malformed timestamp header".to_string()))?,
        nonce: read_header(HDR_NONCE)?,
        signature: read_header(HDR_SIGNATURE)?,
    };

    let method = request.method().as_str().to_string();
    // The client signs the full request target including any query string.
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| request.uri().path())
        .to_string();
    let known_node = state.store.nodes.contains_key(&signed.node_id);
    let clock_skew = state.config.lock().await.cluster.clock_skew;

    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| OpalError::Validation(format!("failed to read request body: {e}")))?;

    rpc::verify_request(
        &token,
        &state.nonces,
        clock_skew,
        known_node,
        &method,
        &path,
        &body_bytes,
        &signed,
    )?;

    let mut request = Request::from_parts(parts, Body::from(body_bytes));
    request.extensions_mut().insert(SourceNode(signed.node_id));
    Ok(next.run(request).await)
}

// --- Join handshake ---

async fn validate_token(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ValidateTokenRequest>,
) -> Result<ApiOk<Ack>, OpalError> {
    state.cluster.validate_token(&body.cluster_token)?;
    Ok(ApiOk(Ack {}))
}

async fn register_node(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RegisterNodeRequest>,
) -> Result<ApiOk<RegisterNodeResponse>, OpalError> {
    state.cluster.validate_token(&body.cluster_token)?;
    let nodes = state.cluster.accept_registration(body.node)?;
    let region = state
        .store
        .cluster_config_snapshot()
        .map(|c| c.region)
        .unwrap_or_default();
    Ok(ApiOk(RegisterNodeResponse { nodes, region }))
}

#[derive(Deserialize)]
struct NodesQuery {
    cluster_token: String,
}

async fn list_nodes_with_token(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<NodesQuery>,
) -> Result<ApiOk<Vec<Node>>, OpalError> {
    state.cluster.validate_token(&query.cluster_token)?;
    Ok(ApiOk(state.cluster.list_nodes()))
}

async fn health() -> ApiOk<Ack> {
    ApiOk(Ack {})
}

// --- State sync ---

async fn sync_entity<T: Replicated>(
    State(state): State<Arc<ServerState>>,
    Json(row): Json<T>,
) -> Result<ApiOk<SyncResponse>, OpalError>
where
    crate::core::metastore::MetaStore: crate::core::metastore::EntityStore<T>,
{
    let outcome = apply_incoming(&state.store, row);
    Ok(ApiOk(SyncResponse { outcome }))
}

async fn delete_sync<T: Replicated>(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<DeleteSyncRequest>,
) -> Result<ApiOk<DeleteSyncResponse>, OpalError>
where
    crate::core::metastore::MetaStore: crate::core::metastore::EntityStore<T>,
{
    let outcome = apply_incoming_delete(&state.store, T::KIND, &body);
    Ok(ApiOk(DeleteSyncResponse { outcome }))
}

async fn get_snapshot(
    State(state): State<Arc<ServerState>>,
) -> Result<ApiOk<StateSnapshot>, OpalError> {
    Ok(ApiOk(build_snapshot(&state.store)?))
}

async fn receive_snapshot(
    State(state): State<Arc<ServerState>>,
    Json(snapshot): Json<StateSnapshot>,
) -> Result<ApiOk<Ack>, OpalError> {
    import_snapshot(&state.store, &snapshot);
    Ok(ApiOk(Ack {}))
}

// --- Migration transfers ---

async fn receive_permissions(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<BucketPermissionsTransfer>,
) -> Result<ApiOk<Ack>, OpalError> {
    for permission in body.permissions {
        apply_incoming(&state.store, permission);
    }
    Ok(ApiOk(Ack {}))
}

async fn receive_acl(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<BucketAclTransfer>,
) -> Result<ApiOk<Ack>, OpalError> {
    apply_incoming(&state.store, body.acl);
    Ok(ApiOk(Ack {}))
}

async fn receive_config(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<BucketConfigTransfer>,
) -> Result<ApiOk<Ack>, OpalError> {
    apply_incoming(&state.store, body.config);
    Ok(ApiOk(Ack {}))
}

// --- Object replication & migration ---

fn push_meta_from_headers(headers: &axum::http::HeaderMap) -> Result<ObjectPushMeta, OpalError> {
    let read = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let size = read("x-object-size")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| OpalError::Validation("missing x-object-size header".to_string()))?;
    let etag = read("x-object-etag")
        .map(|v| v.to_string())
        .ok_or_else(|| OpalError::Validation("missing x-object-etag header".to_string()))?;
    let metadata: HashMap<String, String> = read("x-object-metadata")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    Ok(ObjectPushMeta {
        size,
        etag,
        content_type: read("x-object-content-type").map(|v| v.to_string()),
        metadata,
        source_version_id: read("x-source-version-id").map(|v| v.to_string()),
    })
}

async fn receive_object(
    State(state): State<Arc<ServerState>>,
    Path((tenant, bucket, key)): Path<(String, String, String)>,
    headers: axum::http::HeaderMap,
    body: BodyBytes,
) -> Result<ApiOk<Ack>, OpalError> {
    let meta = push_meta_from_headers(&headers)?;
    state
        .objects
        .apply_replicated_put(&tenant, &bucket, &key, body, &meta)
        .await?;
    Ok(ApiOk(Ack {}))
}

async fn delete_object(
    State(state): State<Arc<ServerState>>,
    Path((tenant, bucket, key)): Path<(String, String, String)>,
) -> Result<ApiOk<Ack>, OpalError> {
    state
        .objects
        .apply_replicated_delete(&tenant, &bucket, &key)
        .await?;
    Ok(ApiOk(Ack {}))
}

async fn stat_object(
    State(state): State<Arc<ServerState>>,
    Path((tenant, bucket, key)): Path<(String, String, String)>,
) -> Result<ApiOk<ObjectStatResponse>, OpalError> {
    let meta = state
        .objects
        .stat_object(&tenant, &bucket, &key)
        .await?
        .ok_or_else(|| OpalError::NotFound(format!("no such object '{key}'")))?;
    Ok(ApiOk(ObjectStatResponse {
        key: meta.key,
        size: meta.size,
        etag: meta.etag,
    }))
}

/// Migration rollback target: drop the bucket and everything copied into it.
async fn delete_bucket(
    State(state): State<Arc<ServerState>>,
    Path((tenant, bucket)): Path<(String, String)>,
) -> Result<ApiOk<Ack>, OpalError> {
    state.objects.delete_bucket(&tenant, &bucket, true).await?;
    state.router.invalidate(&format!("{tenant}/{bucket}"));
    Ok(ApiOk(Ack {}))
}

// --- Aggregation reads ---

#[derive(Deserialize)]
struct BucketsQuery {
    tenant_id: Option<String>,
}

async fn list_local_buckets(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<BucketsQuery>,
) -> Result<ApiOk<Vec<BucketInfo>>, OpalError> {
    let buckets = state
        .objects
        .list_local_buckets(query.tenant_id.as_deref())
        .await?;
    Ok(ApiOk(buckets))
}

async fn tenant_storage(
    State(state): State<Arc<ServerState>>,
    Path(tenant_id): Path<String>,
) -> Result<ApiOk<TenantStorageResponse>, OpalError> {
    Ok(ApiOk(TenantStorageResponse {
        current_storage_bytes: state.store.tenant_usage_bytes(&tenant_id),
        tenant_id,
    }))
}

async fn bucket_owner(
    State(state): State<Arc<ServerState>>,
    Path(bucket): Path<String>,
) -> Result<ApiOk<BucketOwnershipResponse>, OpalError> {
    let owned = state.objects.owns_bucket(&bucket).await;
    Ok(ApiOk(BucketOwnershipResponse { bucket, owned }))
}

async fn cache_invalidate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CacheInvalidateRequest>,
) -> Result<ApiOk<Ack>, OpalError> {
    state.router.invalidate(&body.bucket);
    Ok(ApiOk(Ack {}))
}

async fn jwt_secret(
    State(state): State<Arc<ServerState>>,
) -> Result<ApiOk<JwtSecretResponse>, OpalError> {
    Ok(ApiOk(JwtSecretResponse {
        jwt_secret: state.jwt_secret.read().clone(),
    }))
}
