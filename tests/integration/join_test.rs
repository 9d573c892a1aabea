// tests/integration/join_test.rs

//! Two-node join over real listeners: initialize A, join B through A, and
//! verify both sides converge on the same membership view.

use super::test_helpers::TestNode;

#[tokio::test]
async fn two_node_join_converges_membership() {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;

    let token = node_a.initialize_cluster().await;
    node_b.join(&node_a, &token).await;

    // Both sides list the same two nodes.
    let (status, body) = node_a.console_get("/cluster/nodes").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = node_b.console_get("/cluster/nodes").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    // Both report cluster mode with matching tokens.
    let (_, status_a) = node_a.console_get("/cluster/status").await;
    let (_, status_b) = node_b.console_get("/cluster/status").await;
    assert_eq!(status_a["data"]["is_cluster_enabled"], true);
    assert_eq!(status_b["data"]["is_cluster_enabled"], true);

    let (_, token_a) = node_a.console_get("/cluster/token").await;
    let (_, token_b) = node_b.console_get("/cluster/token").await;
    assert_eq!(token_a["data"]["cluster_token"], token_b["data"]["cluster_token"]);

    // The joiner adopted the seed node's JWT secret.
    assert_eq!(
        *node_a.state.jwt_secret.read(),
        *node_b.state.jwt_secret.read()
    );
}

#[tokio::test]
async fn initialize_twice_conflicts() {
    let node = TestNode::spawn("solo").await;
    node.initialize_cluster().await;
    let (status, body) = node
        .console_post("/cluster/initialize", serde_json::json!({}))
        .await;
    assert_eq!(status, 409, "second initialize: {body}");
}

#[tokio::test]
async fn join_with_bad_token_is_rejected() {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;
    node_a.initialize_cluster().await;

    let (status, _body) = node_b
        .console_post(
            "/cluster/join",
            serde_json::json!({
                "cluster_token": "definitely-wrong",
                "node_endpoint": node_a.endpoint(),
            }),
        )
        .await;
    assert_eq!(status, 401);
    assert!(!node_b.state.store.is_cluster_enabled());
}

#[tokio::test]
async fn joined_member_cannot_join_again() {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;
    let token = node_a.initialize_cluster().await;
    node_b.join(&node_a, &token).await;

    let (status, _) = node_b
        .console_post(
            "/cluster/join",
            serde_json::json!({
                "cluster_token": token,
                "node_endpoint": node_a.endpoint(),
            }),
        )
        .await;
    assert_eq!(status, 409);
}

#[tokio::test]
async fn leave_returns_node_to_standalone() {
    let node_a = TestNode::spawn("node-a").await;
    let node_b = TestNode::spawn("node-b").await;
    let token = node_a.initialize_cluster().await;
    node_b.join(&node_a, &token).await;

    let (status, _) = node_b
        .console_post("/cluster/leave", serde_json::json!({}))
        .await;
    assert_eq!(status, 200);
    assert!(!node_b.state.store.is_cluster_enabled());
    let (_, body) = node_b.console_get("/cluster/status").await;
    assert_eq!(body["data"]["is_cluster_enabled"], false);
}

#[tokio::test]
async fn control_api_requires_the_admin_token() {
    let node = TestNode::spawn("node-a").await;
    let response = node
        .http
        .get(node.console_url("/cluster/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn removing_the_local_node_is_refused() {
    let node = TestNode::spawn("node-a").await;
    node.initialize_cluster().await;
    let local_id = node.state.store.local_node_id().unwrap();
    let response = node
        .http
        .delete(node.console_url(&format!("/cluster/nodes/{local_id}")))
        .bearer_auth(super::test_helpers::ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}
