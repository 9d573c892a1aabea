// tests/integration/hmac_test.rs

//! The signed RPC plane over real HTTP: replay rejection, skew rejection,
//! tampered signatures, and unknown nodes.

use super::test_helpers::TestNode;
use opalstore::core::cluster::rpc::{
    self, HDR_NODE_ID, HDR_NONCE, HDR_SIGNATURE, HDR_TIMESTAMP, SignedHeaders,
};
use opalstore::core::now_secs;

async fn cluster_pair() -> (TestNode, TestNode, String) {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;
    let token = node_a.initialize_cluster().await;
    node_b.join(&node_a, &token).await;
    (node_a, node_b, token)
}

async fn send_signed(node_a: &TestNode, headers: &SignedHeaders, path: &str) -> u16 {
    node_a
        .http
        .get(format!("{}{}", node_a.endpoint(), path))
        .header(HDR_NODE_ID, &headers.node_id)
        .header(HDR_TIMESTAMP, headers.timestamp.to_string())
        .header(HDR_NONCE, &headers.nonce)
        .header(HDR_SIGNATURE, &headers.signature)
        .send()
        .await
        .unwrap()
        .status()
        .as_u16()
}

#[tokio::test]
async fn replayed_request_is_rejected() {
    // S4: an identical signed request passes once, then fails with 401.
    let (node_a, node_b, token) = cluster_pair().await;
    let path = "/cluster/internal/jwt-secret";
    let b_id = node_b.state.store.local_node_id().unwrap();
    let headers = rpc::sign_request(&token, &b_id, "GET", path, b"").unwrap();

    assert_eq!(send_signed(&node_a, &headers, path).await, 200);
    assert_eq!(send_signed(&node_a, &headers, path).await, 401);
}

#[tokio::test]
async fn stale_timestamp_is_rejected_as_skew() {
    let (node_a, node_b, token) = cluster_pair().await;
    let path = "/cluster/internal/jwt-secret";
    let b_id = node_b.state.store.local_node_id().unwrap();

    let timestamp = now_secs() - 301;
    let nonce = "fixed-nonce".to_string();
    let canonical = rpc::canonical_string(
        "GET",
        path,
        &rpc::body_sha256_hex(b""),
        timestamp,
        &nonce,
        &b_id,
    );
    let headers = SignedHeaders {
        node_id: b_id,
        timestamp,
        nonce,
        signature: rpc::sign(&token, &canonical).unwrap(),
    };
    assert_eq!(send_signed(&node_a, &headers, path).await, 401);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let (node_a, node_b, token) = cluster_pair().await;
    let path = "/cluster/internal/jwt-secret";
    let b_id = node_b.state.store.local_node_id().unwrap();
    let mut headers = rpc::sign_request(&token, &b_id, "GET", path, b"").unwrap();
    headers.signature = rpc::sign(&token, "different canonical").unwrap();
    assert_eq!(send_signed(&node_a, &headers, path).await, 401);
}

#[tokio::test]
async fn unknown_node_id_is_rejected() {
    let (node_a, _node_b, token) = cluster_pair().await;
    let path = "/cluster/internal/jwt-secret";
    let headers = rpc::sign_request(&token, "not-a-member", "GET", path, b"").unwrap();
    assert_eq!(send_signed(&node_a, &headers, path).await, 401);
}

#[tokio::test]
async fn unsigned_request_to_signed_endpoint_is_rejected() {
    let (node_a, _node_b, _token) = cluster_pair().await;
    let status = node_a
        .http
        .get(format!("{}/cluster/internal/jwt-secret", node_a.endpoint()))
        .send()
        .await
        .unwrap()
        .status()
        .as_u16();
    assert_eq!(status, 401);
}

#[tokio::test]
async fn health_probe_needs_no_signature() {
    let (node_a, _node_b, _token) = cluster_pair().await;
    let status = node_a
        .http
        .get(format!("{}/cluster/internal/health", node_a.endpoint()))
        .send()
        .await
        .unwrap()
        .status()
        .as_u16();
    assert_eq!(status, 200);
}
