// src/core/cluster/rpc.rs

//! Signing and verification of inter-node requests. Every peer call carries
//! an HMAC-SHA256 signature over a canonical request string, keyed by the
//! shared cluster token, plus replay protection via a nonce cache and a
//! bounded clock-skew window.

use crate::core::errors::OpalError;
use crate::core::{metrics, now_secs};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Header names of the signed request envelope.
pub const HDR_NODE_ID: &str = "x-cluster-node-id";
pub const HDR_TIMESTAMP: &str = "x-cluster-timestamp";
pub const HDR_NONCE: &str = "x-cluster-nonce";
pub const HDR_SIGNATURE: &str = "x-cluster-signature";

/// The signed header set attached to an outbound peer request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub node_id: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

/// SHA-256 of the request body, hex encoded. The canonical string commits to
/// the body so it cannot be swapped under a valid signature.
pub fn body_sha256_hex(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// The canonical request representation both sides sign.
pub fn canonical_string(
    method: &str,
    path: &str,
    body_sha256: &str,
    timestamp: i64,
    nonce: &str,
    node_id: &str,
) -> String {
    format!("{method}\n{path}\n{body_sha256}\n{timestamp}\n{nonce}\n{node_id}")
}

/// Computes the base64 signature for a canonical string.
pub fn sign(cluster_token: &str, canonical: &str) -> Result<String, OpalError> {
    let mut mac = HmacSha256::new_from_slice(cluster_token.as_bytes())
        .map_err(|e| OpalError::Internal(format!("failed to build HMAC instance: {e}")))?;
    mac.update(canonical.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Builds the full signed header set for an outbound request.
pub fn sign_request(
    cluster_token: &str,
    node_id: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<SignedHeaders, OpalError> {
    let timestamp = now_secs();
    let nonce = uuid::Uuid::new_v4().to_string();
    let canonical = canonical_string(
        method,
        path,
        &body_sha256_hex(body),
        timestamp,
        &nonce,
        node_id,
    );
    let signature = sign(cluster_token, &canonical)?;
    Ok(SignedHeaders {
        node_id: node_id.to_string(),
        timestamp,
        nonce,
        signature,
    })
}

/// Remembers `(node_id, timestamp, nonce)` triples inside the skew window so
/// a captured request cannot be replayed.
#[derive(Debug)]
pub struct NonceCache {
    seen: DashMap<String, i64>,
    last_eviction: AtomicI64,
    window: Duration,
}

impl NonceCache {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            last_eviction: AtomicI64::new(0),
            window,
        }
    }

    fn key(node_id: &str, timestamp: i64, nonce: &str) -> String {
        format!("{node_id}:{timestamp}:{nonce}")
    }

    /// Registers a triple; returns `false` when it was already seen.
    pub fn register(&self, node_id: &str, timestamp: i64, nonce: &str) -> bool {
        self.maybe_evict();
        self.seen
            .insert(Self::key(node_id, timestamp, nonce), timestamp)
            .is_none()
    }

    /// Drops entries whose timestamp has aged out of the skew window.
    /// Runs at most once per window half to keep the hot path cheap.
    fn maybe_evict(&self) {
        let now = now_secs();
        let last = self.last_eviction.load(Ordering::Relaxed);
        let half_window = (self.window.as_secs() / 2).max(1) as i64;
        if now - last < half_window {
            return;
        }
        if self
            .last_eviction
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let horizon = now - self.window.as_secs() as i64;
        self.seen.retain(|_, ts| *ts >= horizon);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Verifies one incoming request. `known_node` reports whether the claimed
/// node id belongs to a registered peer.
#[allow(clippy::too_many_arguments)]
pub fn verify_request(
    cluster_token: &str,
    nonces: &NonceCache,
    clock_skew: Duration,
    known_node: bool,
    method: &str,
    path: &str,
    body: &[u8],
    headers: &SignedHeaders,
) -> Result<(), OpalError> {
    // 1. Timestamp inside the tolerated skew window.
    let now = now_secs();
    if (now - headers.timestamp).unsigned_abs() > clock_skew.as_secs() {
        metrics::RPC_VERIFICATIONS_TOTAL
            .with_label_values(&["clock_skew"])
            .inc();
        return Err(OpalError::ClockSkew);
    }

    // 2. The claimed node must be a registered peer.
    if !known_node {
        metrics::RPC_VERIFICATIONS_TOTAL
            .with_label_values(&["unknown_node"])
            .inc();
        return Err(OpalError::Unauthorized(format!(
            "unknown cluster node '{}'",
            headers.node_id
        )));
    }

    // 3. Signature over the canonical string, compared in constant time.
    let canonical = canonical_string(
        method,
        path,
        &body_sha256_hex(body),
        headers.timestamp,
        &headers.nonce,
        &headers.node_id,
    );
    let mut mac = HmacSha256::new_from_slice(cluster_token.as_bytes())
        .map_err(|e| OpalError::Internal(format!("failed to build HMAC instance: {e}")))?;
    mac.update(canonical.as_bytes());
    let presented = BASE64
        .decode(&headers.signature)
        .map_err(|_| OpalError::Unauthorized("malformed signature encoding".to_string()))?;
    if mac.verify_slice(&presented).is_err() {
        metrics::RPC_VERIFICATIONS_TOTAL
            .with_label_values(&["bad_signature"])
            .inc();
        return Err(OpalError::Unauthorized(
            "cluster request signature mismatch".to_string(),
        ));
    }

    // 4. Nonce must be fresh for this (node, timestamp). Checked after the
    // signature so unauthenticated traffic cannot poison the cache.
    if !nonces.register(&headers.node_id, headers.timestamp, &headers.nonce) {
        metrics::RPC_VERIFICATIONS_TOTAL
            .with_label_values(&["replay"])
            .inc();
        return Err(OpalError::Replay);
    }

    metrics::RPC_VERIFICATIONS_TOTAL
        .with_label_values(&["ok"])
        .inc();
    Ok(())
}
