//! End-to-end tests of the event stream over a real WebSocket.
//!
//! Each test binds the router on an ephemeral port and connects with
//! `tokio-tungstenite`. HTTP calls go through a second router built on the
//! same [`AppState`], so both see the same stores and notifier.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tower::ServiceExt;

use piper_server::config::Config;
use piper_server::routes::{create_router, AppState};
use piper_server::token::SigningKey;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    app: Router,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_test_server() -> TestServer {
    let mut config = Config::new(SigningKey::new("websocket-test-signing-key"));
    config.bcrypt_cost = 4;
    config.push_timeout = Duration::from_secs(1);
    let state = AppState::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let served = create_router(state.clone());
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            served.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        app: create_router(state.clone()),
        state,
        handle,
    }
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    body: Value,
) -> (StatusCode, HeaderValue, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header(AUTHORIZATION, bearer);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let authorization = response
        .headers()
        .get(AUTHORIZATION)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(""));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, authorization, body)
}

/// Signs up `name` and returns the `Authorization` header value.
async fn sign_up(app: &Router, name: &str) -> String {
    let (status, authorization, body) = call(
        app,
        Method::POST,
        "/v1/users",
        None,
        json!({
            "email": format!("{name}@example.com"),
            "password": "password",
            "passwordConf": "password",
            "userName": name,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    authorization.to_str().unwrap().to_string()
}

async fn create_channel(app: &Router, bearer: &str) -> String {
    let (status, _, body) = call(
        app,
        Method::POST,
        "/v1/channels",
        Some(bearer),
        json!({"name": "general"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

async fn post_message(app: &Router, bearer: &str, channel_id: &str, text: &str) {
    let (status, _, _) = call(
        app,
        Method::POST,
        "/v1/messages",
        Some(bearer),
        json!({"channelID": channel_id, "body": text}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

/// Opens a WebSocket authenticated with the `Authorization` header.
async fn connect(server: &TestServer, bearer: &str) -> WsStream {
    let mut request = format!("ws://{}/v1/websocket", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_str(bearer).unwrap());
    let (ws, _) = timeout(TIMEOUT, connect_async(request))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Waits until the notifier has exactly `expected` clients.
async fn wait_for_clients(state: &AppState, expected: usize) {
    timeout(TIMEOUT, async {
        while state.notifier.client_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {expected} clients"));
}

/// Next text frame from `ws`.
async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("no frame within timeout")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn every_client_receives_identical_frames() {
    let server = spawn_test_server().await;
    let bearer = sign_up(&server.app, "ada").await;
    let channel_id = create_channel(&server.app, &bearer).await;

    let mut first = connect(&server, &bearer).await;
    let mut second = connect(&server, &bearer).await;
    wait_for_clients(&server.state, 2).await;

    post_message(&server.app, &bearer, &channel_id, "hi").await;

    let a = next_text(&mut first).await;
    let b = next_text(&mut second).await;
    assert_eq!(a, b);

    let event: Value = serde_json::from_str(&a).unwrap();
    assert_eq!(event["type"], "NEW_MESSAGE");
    assert_eq!(event["data"]["body"], "hi");
}

#[tokio::test]
async fn events_arrive_in_order() {
    let server = spawn_test_server().await;
    let bearer = sign_up(&server.app, "ada").await;
    let channel_id = create_channel(&server.app, &bearer).await;

    let mut ws = connect(&server, &bearer).await;
    wait_for_clients(&server.state, 1).await;

    for i in 0..20 {
        post_message(&server.app, &bearer, &channel_id, &format!("message {i}")).await;
    }

    for i in 0..20 {
        let event: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(event["data"]["body"], format!("message {i}"));
    }
}

#[tokio::test]
async fn closed_client_is_removed_and_others_still_receive() {
    let server = spawn_test_server().await;
    let bearer = sign_up(&server.app, "ada").await;
    let channel_id = create_channel(&server.app, &bearer).await;

    let mut survivor = connect(&server, &bearer).await;
    let mut leaver = connect(&server, &bearer).await;
    wait_for_clients(&server.state, 2).await;

    leaver.close(None).await.unwrap();
    drop(leaver);
    wait_for_clients(&server.state, 1).await;

    post_message(&server.app, &bearer, &channel_id, "still here").await;
    let event: Value = serde_json::from_str(&next_text(&mut survivor).await).unwrap();
    assert_eq!(event["data"]["body"], "still here");
}

#[tokio::test]
async fn dropped_transport_is_removed() {
    let server = spawn_test_server().await;
    let bearer = sign_up(&server.app, "ada").await;

    let ws = connect(&server, &bearer).await;
    wait_for_clients(&server.state, 1).await;

    // No close handshake: the read half sees the TCP connection end.
    drop(ws);
    wait_for_clients(&server.state, 0).await;
}

#[tokio::test]
async fn browser_clients_authenticate_with_query_parameter() {
    let server = spawn_test_server().await;
    let bearer = sign_up(&server.app, "ada").await;
    let token = bearer.strip_prefix("Bearer ").unwrap();

    let url = format!("ws://{}/v1/websocket?auth={token}", server.addr);
    let (_ws, response) = timeout(TIMEOUT, connect_async(url))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    wait_for_clients(&server.state, 1).await;
}

#[tokio::test]
async fn upgrade_without_valid_session_is_refused() {
    let server = spawn_test_server().await;

    let status_of = |result: Result<_, WsError>| match result {
        Err(WsError::Http(response)) => response.status(),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    };

    let url = format!("ws://{}/v1/websocket", server.addr);
    let missing = connect_async(url).await;
    assert_eq!(status_of(missing), StatusCode::BAD_REQUEST);

    let forged = format!("ws://{}/v1/websocket?auth=not-a-real-token", server.addr);
    assert_eq!(status_of(connect_async(forged).await), StatusCode::UNAUTHORIZED);

    // Signed out sessions cannot subscribe.
    let bearer = sign_up(&server.app, "ada").await;
    let (status, _, _) = call(
        &server.app,
        Method::DELETE,
        "/v1/sessions/mine",
        Some(&bearer),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = bearer.strip_prefix("Bearer ").unwrap();
    let expired = format!("ws://{}/v1/websocket?auth={token}", server.addr);
    assert_eq!(status_of(connect_async(expired).await), StatusCode::UNAUTHORIZED);

    assert_eq!(server.state.notifier.client_count().await, 0);
}
