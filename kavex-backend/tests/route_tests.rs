use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use kavex_backend::config::Config;
use kavex_backend::delivery::{PostError, Presentation, WebhookApi};
use kavex_backend::{AppState, create_app};
use kavex_db::{Database, DeliveryEndpoint};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
// for `oneshot` method

struct NoWebhooks;

#[async_trait]
impl WebhookApi for NoWebhooks {
    async fn create(&self, _channel_id: u64, _name: &str) -> Result<DeliveryEndpoint, PostError> {
        Err(PostError::Forbidden)
    }

    async fn execute(&self, _: &DeliveryEndpoint, _: &Presentation) -> Result<(), PostError> {
        Err(PostError::Forbidden)
    }
}

/// Helper to build state over an in-memory SQLite database
async fn setup_state() -> Arc<AppState> {
    let db = Database::open_in_memory()
        .await
        .expect("Failed to create in-memory database");
    AppState::new(Config::default(), db, Arc::new(NoWebhooks))
}

/// Helper to send a request and get response
async fn send_request(
    state: Arc<AppState>,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    // the rate limiter keys on the client address
    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("x-forwarded-for", "203.0.113.7");

    if let Some(token) = bearer {
        request_builder = request_builder.header("Authorization", format!("Bearer {}", token));
    }

    let request = request_builder.body(Body::empty()).unwrap();
    let response = create_app(state).oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

// =============================================================================
// HEALTH ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    // GIVEN: A running application
    let state = setup_state().await;

    // WHEN: Making a GET request to /health
    let (status, _body) = send_request(state, "GET", "/health", None).await;

    // THEN: Should return 200 OK
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_endpoint_with_post_method() {
    // GIVEN: A running application
    let state = setup_state().await;

    // WHEN: Making a POST request to /health
    let (status, _body) = send_request(state, "POST", "/health", None).await;

    // THEN: Should return 405 Method Not Allowed
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

// =============================================================================
// SOCKET ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_socket_path_requires_upgrade() {
    // GIVEN: A running application
    let state = setup_state().await;

    // WHEN: Hitting the socket path with a plain GET
    let (status, _body) = send_request(state, "GET", "/mcws", None).await;

    // THEN: Not an upgrade, so the request is refused
    assert!(status.is_client_error(), "got {status}");
}

// =============================================================================
// STATUS ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_status_for_linked_token() {
    // GIVEN: A linked channel
    let state = setup_state().await;
    state
        .admin
        .connect(1, 10, "plugin-token")
        .await
        .expect("Failed to link channel");

    // WHEN: The plugin asks for its status
    let (status, body) = send_request(state, "GET", "/status", Some("plugin-token")).await;

    // THEN: Should describe the link, with no live session
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["linked"], true);
    assert_eq!(body["guild_id"], 1);
    assert_eq!(body["channel_id"], 10);
    assert_eq!(body["status"], "disconnected");
    assert_eq!(body["session_active"], false);
    assert!(body.get("last_seen_at").is_none());
}

#[tokio::test]
async fn test_status_with_unknown_token() {
    // GIVEN: An empty database
    let state = setup_state().await;

    // WHEN: Asking with a token nobody linked
    let (status, body) = send_request(state, "GET", "/status", Some("nobody-linked-this")).await;

    // THEN: Should return 401 with JSON error
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let error_msg = body["error"].as_str().unwrap();
    assert!(error_msg.contains("Token"), "Error message: {}", error_msg);
}

#[tokio::test]
async fn test_status_without_authorization() {
    // GIVEN: A running application
    let state = setup_state().await;

    // WHEN: Asking without a bearer token
    let (status, _body) = send_request(state, "GET", "/status", None).await;

    // THEN: Should be rejected
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_with_oversized_token() {
    // GIVEN: A running application
    let state = setup_state().await;

    // WHEN: The token exceeds the length limit
    let token = "x".repeat(300);
    let (status, body) = send_request(state, "GET", "/status", Some(&token)).await;

    // THEN: Validation error with details, and the token is not echoed
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid request");
    assert!(body.get("details").is_some());
    assert!(!body.to_string().contains(&token));
}

#[tokio::test]
async fn test_status_reflects_rekey() {
    // GIVEN: A channel whose token was replaced
    let state = setup_state().await;
    state.admin.connect(1, 10, "old-token").await.unwrap();
    state.admin.connect(1, 10, "new-token").await.unwrap();

    // WHEN: Asking with each token
    let (old_status, _) = send_request(state.clone(), "GET", "/status", Some("old-token")).await;
    let (new_status, _) = send_request(state, "GET", "/status", Some("new-token")).await;

    // THEN: Only the new one is recognized
    assert_eq!(old_status, StatusCode::UNAUTHORIZED);
    assert_eq!(new_status, StatusCode::OK);
}
