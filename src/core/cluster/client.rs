// src/core/cluster/client.rs

//! The signed HTTP client used for every call to a peer node. All methods
//! build the canonical string for the request, attach the HMAC header set,
//! and unwrap the JSON envelope of the response.

use crate::config::ClusterTuning;
use crate::core::OpalError;
use crate::core::cluster::rpc::{self, HDR_NODE_ID, HDR_NONCE, HDR_SIGNATURE, HDR_TIMESTAMP};
use crate::core::cluster::wire::{
    Ack, BucketAclTransfer, BucketConfigTransfer, BucketOwnershipResponse,
    BucketPermissionsTransfer, CacheInvalidateRequest, DeleteOutcome, DeleteSyncRequest,
    DeleteSyncResponse, Envelope, JwtSecretResponse, ObjectPushMeta, RegisterNodeRequest,
    ObjectStatResponse, RegisterNodeResponse, StateSnapshot, SyncOutcome, SyncResponse,
    TenantStorageResponse, ValidateTokenRequest, kind_slug,
};
use crate::core::entities::{
    BucketAcl, BucketConfig, BucketInfo, BucketPermission, EntityKind, Node, Replicated,
};
use crate::core::metastore::MetaStore;
use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Prefix under which the internal cluster API is mounted on every node.
pub const INTERNAL_PREFIX: &str = "/cluster/internal";

/// Assumed minimum transfer rate used to scale object push deadlines.
const OBJECT_PUSH_BYTES_PER_SEC: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct PeerClient {
    http: reqwest::Client,
    store: Arc<MetaStore>,
    request_timeout: Duration,
    snapshot_timeout: Duration,
}

impl PeerClient {
    pub fn new(tuning: &ClusterTuning, store: Arc<MetaStore>) -> Self {
        Self {
            http: reqwest::Client::builder().build().unwrap_or_default(),
            store,
            request_timeout: tuning.request_timeout,
            snapshot_timeout: tuning.snapshot_timeout,
        }
    }

    fn signing_material(&self) -> Result<(String, String), OpalError> {
        let config = self
            .store
            .cluster_config_snapshot()
            .ok_or(OpalError::NotInCluster)?;
        Ok((config.cluster_token, config.node_id))
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{path}", endpoint.trim_end_matches('/'))
    }

    fn error_from_status(status: u16, message: String) -> OpalError {
        match status {
            400 => OpalError::Validation(message),
            401 => OpalError::Unauthorized(message),
            403 => OpalError::QuotaExceeded(message),
            404 => OpalError::NotFound(message),
            409 => OpalError::Conflict(message),
            429 => OpalError::RateLimited(message),
            _ => OpalError::HttpClient(format!("peer returned {status}: {message}")),
        }
    }

    /// Unwraps a JSON envelope, converting error envelopes and transport
    /// failures into the matching `OpalError`.
    async fn unwrap_envelope<R: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<R, OpalError> {
        let status = response.status().as_u16();
        let envelope: Envelope<R> = response.json().await?;
        if envelope.success {
            envelope
                .data
                .ok_or_else(|| OpalError::Internal("peer response missing data".to_string()))
        } else {
            let message = envelope
                .error
                .unwrap_or_else(|| "unknown peer error".to_string());
            Err(Self::error_from_status(
                envelope.code.unwrap_or(status),
                message,
            ))
        }
    }

    /// Sends one signed request with a JSON body and parses the envelope.
    async fn send_signed<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<R, OpalError> {
        let (token, node_id) = self.signing_material()?;
        let body_bytes = match body {
            Some(b) => serde_json::to_vec(b)?,
            None => Vec::new(),
        };
        let headers = rpc::sign_request(&token, &node_id, method.as_str(), path, &body_bytes)?;

        let mut request = self
            .http
            .request(method, Self::url(endpoint, path))
            .timeout(timeout)
            .header(HDR_NODE_ID, &headers.node_id)
            .header(HDR_TIMESTAMP, headers.timestamp.to_string())
            .header(HDR_NONCE, &headers.nonce)
            .header(HDR_SIGNATURE, &headers.signature);
        if !body_bytes.is_empty() {
            request = request
                .header("content-type", "application/json")
                .body(body_bytes);
        }
        Self::unwrap_envelope(request.send().await?).await
    }

    async fn post_signed<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
    ) -> Result<R, OpalError> {
        self.send_signed(Method::POST, endpoint, path, Some(body), self.request_timeout)
            .await
    }

    async fn get_signed<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<R, OpalError> {
        self.send_signed::<(), R>(Method::GET, endpoint, path, None, timeout)
            .await
    }

    // --- Join handshake (token-authenticated, unsigned) ---

    /// Join step 1: check our token against the remote before registering.
    pub async fn validate_token(&self, endpoint: &str, token: &str) -> Result<(), OpalError> {
        let response = self
            .http
            .post(Self::url(
                endpoint,
                &format!("{INTERNAL_PREFIX}/validate-token"),
            ))
            .timeout(self.request_timeout)
            .json(&ValidateTokenRequest {
                cluster_token: token.to_string(),
            })
            .send()
            .await?;
        if response.status().as_u16() == 401 {
            return Err(OpalError::BadToken);
        }
        Self::unwrap_envelope::<Ack>(response).await.map(|_| ())
    }

    /// Join step 2: register ourselves and learn the remote's node list.
    pub async fn register_node(
        &self,
        endpoint: &str,
        token: &str,
        node: Node,
    ) -> Result<RegisterNodeResponse, OpalError> {
        let response = self
            .http
            .post(Self::url(
                endpoint,
                &format!("{INTERNAL_PREFIX}/register-node"),
            ))
            .timeout(self.request_timeout)
            .json(&RegisterNodeRequest {
                cluster_token: token.to_string(),
                node,
            })
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    /// Token-authenticated peer listing used during join bootstrap.
    pub async fn list_nodes_with_token(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<Vec<Node>, OpalError> {
        let path = format!(
            "{INTERNAL_PREFIX}/nodes?cluster_token={}",
            urlencoding::encode(token)
        );
        let response = self
            .http
            .get(Self::url(endpoint, &path))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    /// Unauthenticated liveness probe.
    pub async fn health(&self, endpoint: &str) -> Result<(), OpalError> {
        let response = self
            .http
            .get(Self::url(endpoint, &format!("{INTERNAL_PREFIX}/health")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(OpalError::Unreachable(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }

    // --- State sync ---

    pub async fn push_entity<T: Replicated>(
        &self,
        endpoint: &str,
        row: &T,
    ) -> Result<SyncOutcome, OpalError> {
        let path = format!("{INTERNAL_PREFIX}/{}-sync", kind_slug(T::KIND));
        let response: SyncResponse = self.post_signed(endpoint, &path, row).await?;
        Ok(response.outcome)
    }

    pub async fn push_delete(
        &self,
        endpoint: &str,
        kind: EntityKind,
        request: &DeleteSyncRequest,
    ) -> Result<DeleteOutcome, OpalError> {
        let path = format!("{INTERNAL_PREFIX}/{}-delete-sync", kind_slug(kind));
        let response: DeleteSyncResponse = self.post_signed(endpoint, &path, request).await?;
        Ok(response.outcome)
    }

    pub async fn fetch_snapshot(&self, endpoint: &str) -> Result<StateSnapshot, OpalError> {
        self.get_signed(
            endpoint,
            &format!("{INTERNAL_PREFIX}/state-snapshot"),
            self.snapshot_timeout,
        )
        .await
    }

    /// Pushes our full snapshot to a peer, which imports it row-wise with LWW.
    pub async fn push_snapshot(
        &self,
        endpoint: &str,
        snapshot: &StateSnapshot,
    ) -> Result<(), OpalError> {
        self.send_signed::<_, Ack>(
            Method::POST,
            endpoint,
            &format!("{INTERNAL_PREFIX}/state-snapshot"),
            Some(snapshot),
            self.snapshot_timeout,
        )
        .await
        .map(|_| ())
    }

    // --- Aggregation reads ---

    pub async fn list_buckets(
        &self,
        endpoint: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<BucketInfo>, OpalError> {
        let path = match tenant_id {
            Some(t) => format!(
                "{INTERNAL_PREFIX}/buckets?tenant_id={}",
                urlencoding::encode(t)
            ),
            None => format!("{INTERNAL_PREFIX}/buckets"),
        };
        self.get_signed(endpoint, &path, self.request_timeout).await
    }

    pub async fn tenant_storage(&self, endpoint: &str, tenant_id: &str) -> Result<u64, OpalError> {
        let path = format!(
            "{INTERNAL_PREFIX}/tenant/{}/storage",
            urlencoding::encode(tenant_id)
        );
        let response: TenantStorageResponse =
            self.get_signed(endpoint, &path, self.request_timeout).await?;
        Ok(response.current_storage_bytes)
    }

    /// Router probe: does the peer own this bucket path?
    pub async fn bucket_owner(&self, endpoint: &str, bucket: &str) -> Result<bool, OpalError> {
        let path = format!(
            "{INTERNAL_PREFIX}/bucket-owner/{}",
            urlencoding::encode(bucket)
        );
        let response: BucketOwnershipResponse =
            self.get_signed(endpoint, &path, self.request_timeout).await?;
        Ok(response.owned)
    }

    pub async fn invalidate_cache(&self, endpoint: &str, bucket: &str) -> Result<(), OpalError> {
        self.post_signed::<_, Ack>(
            endpoint,
            &format!("{INTERNAL_PREFIX}/cache-invalidate"),
            &CacheInvalidateRequest {
                bucket: bucket.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    /// Session-sharing bootstrap: pull the shared JWT secret at join time.
    pub async fn jwt_secret(&self, endpoint: &str) -> Result<String, OpalError> {
        let response: JwtSecretResponse = self
            .get_signed(
                endpoint,
                &format!("{INTERNAL_PREFIX}/jwt-secret"),
                self.request_timeout,
            )
            .await?;
        Ok(response.jwt_secret)
    }

    // --- Object replication & migration transfers ---

    fn object_path(tenant: &str, bucket: &str, key: &str) -> String {
        format!(
            "{INTERNAL_PREFIX}/objects/{}/{}/{}",
            urlencoding::encode(tenant),
            urlencoding::encode(bucket),
            urlencoding::encode(key)
        )
    }

    fn object_timeout(size: u64) -> Duration {
        Duration::from_secs(60 + size / OBJECT_PUSH_BYTES_PER_SEC)
    }

    pub async fn push_object(
        &self,
        endpoint: &str,
        tenant: &str,
        bucket: &str,
        key: &str,
        data: Bytes,
        meta: &ObjectPushMeta,
    ) -> Result<(), OpalError> {
        let (token, node_id) = self.signing_material()?;
        let path = Self::object_path(tenant, bucket, key);
        let headers = rpc::sign_request(&token, &node_id, "PUT", &path, &data)?;

        let mut request = self
            .http
            .put(Self::url(endpoint, &path))
            .timeout(Self::object_timeout(meta.size))
            .header(HDR_NODE_ID, &headers.node_id)
            .header(HDR_TIMESTAMP, headers.timestamp.to_string())
            .header(HDR_NONCE, &headers.nonce)
            .header(HDR_SIGNATURE, &headers.signature)
            .header("x-object-size", meta.size.to_string())
            .header("x-object-etag", &meta.etag)
            .header("x-object-metadata", serde_json::to_string(&meta.metadata)?)
            .body(data);
        if let Some(content_type) = &meta.content_type {
            request = request.header("x-object-content-type", content_type);
        }
        if let Some(version) = &meta.source_version_id {
            request = request.header("x-source-version-id", version);
        }
        Self::unwrap_envelope::<Ack>(request.send().await?)
            .await
            .map(|_| ())
    }

    pub async fn delete_object(
        &self,
        endpoint: &str,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(), OpalError> {
        let path = Self::object_path(tenant, bucket, key);
        self.send_signed::<(), Ack>(Method::DELETE, endpoint, &path, None, self.request_timeout)
            .await
            .map(|_| ())
    }

    /// Stats an object on the remote, returning `None` when it is absent.
    pub async fn stat_object(
        &self,
        endpoint: &str,
        tenant: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectStatResponse>, OpalError> {
        let path = Self::object_path(tenant, bucket, key);
        match self
            .send_signed::<(), ObjectStatResponse>(
                Method::GET,
                endpoint,
                &path,
                None,
                self.request_timeout,
            )
            .await
        {
            Ok(stat) => Ok(Some(stat)),
            Err(OpalError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Removes a bucket and its contents on the remote. Used by migration
    /// rollback to drop partially copied state.
    pub async fn delete_remote_bucket(
        &self,
        endpoint: &str,
        tenant: &str,
        bucket: &str,
    ) -> Result<(), OpalError> {
        let path = format!(
            "{INTERNAL_PREFIX}/buckets/{}/{}",
            urlencoding::encode(tenant),
            urlencoding::encode(bucket)
        );
        self.send_signed::<(), Ack>(Method::DELETE, endpoint, &path, None, self.request_timeout)
            .await
            .map(|_| ())
    }

    pub async fn transfer_permissions(
        &self,
        endpoint: &str,
        bucket: &str,
        permissions: Vec<BucketPermission>,
    ) -> Result<(), OpalError> {
        self.post_signed::<_, Ack>(
            endpoint,
            &format!("{INTERNAL_PREFIX}/bucket-permissions"),
            &BucketPermissionsTransfer {
                bucket: bucket.to_string(),
                permissions,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn transfer_acl(&self, endpoint: &str, acl: BucketAcl) -> Result<(), OpalError> {
        self.post_signed::<_, Ack>(
            endpoint,
            &format!("{INTERNAL_PREFIX}/bucket-acl"),
            &BucketAclTransfer { acl },
        )
        .await
        .map(|_| ())
    }

    pub async fn transfer_config(
        &self,
        endpoint: &str,
        config: BucketConfig,
    ) -> Result<(), OpalError> {
        self.post_signed::<_, Ack>(
            endpoint,
            &format!("{INTERNAL_PREFIX}/bucket-config"),
            &BucketConfigTransfer { config },
        )
        .await
        .map(|_| ())
    }
}
