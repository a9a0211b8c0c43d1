//! HTTP routes for the Piper server.
//!
//! - `GET /health` - Health check
//! - `/v1/users`, `/v1/users/me`, `/v1/sessions`, `/v1/sessions/mine` - Accounts and sign-in
//! - `/v1/channels`, `/v1/channels/{id}`, `/v1/channels/{id}/members` - Channels
//! - `/v1/messages`, `/v1/messages/{id}` - Messages
//! - `/v1/resetcodes`, `/v1/passwords/{email}` - Password reset
//! - `GET /v1/websocket` - Event stream
//!
//! # Authentication
//!
//! Everything except health, sign-up, sign-in and password reset requires an
//! `Authorization: Bearer <token>` header. Sign-up and sign-in return the
//! token in the same header. Browsers cannot set headers on a WebSocket
//! upgrade, so `/v1/websocket` also accepts the token as the `auth` query
//! parameter.
//!
//! Every mutation that other users should see is queued on the
//! [`Notifier`] and pushed to every connected WebSocket client.
//!
//! # Example
//!
//! ```rust,no_run
//! use piper_server::config::Config;
//! use piper_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

mod channels;
mod reset;
mod users;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, Extensions, HeaderMap, Request},
    response::Response,
    routing::{get, patch, post, put},
    Json, Router,
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, info};

use crate::broadcast::Notifier;
use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::mail::{LogMailer, Mailer};
use crate::models::messages::{MemMessageStore, MessageStore};
use crate::models::users::{MemUserStore, UserStore};
use crate::session::store::{Keyspace, MemoryStore, StateStore};
use crate::session::{self, SessionError, SessionState};
use crate::token::SignedToken;
use crate::types::Event;

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the original client address when behind a proxy.
const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Maximum accepted request body (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Every field is a cheap handle, so the state is cloned into each request.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Session state keyed by bearer token.
    pub sessions: Arc<dyn StateStore>,

    /// Outstanding reset codes keyed by account email.
    pub resets: Arc<dyn StateStore>,

    pub users: Arc<dyn UserStore>,

    pub messages: Arc<dyn MessageStore>,

    /// Fans events out to WebSocket clients.
    pub notifier: Notifier,

    /// Delivers password reset codes.
    pub mailer: Arc<dyn Mailer>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates state backed entirely by in-memory stores.
    ///
    /// Starts the notifier, so this must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let sessions = MemoryStore::new(Keyspace::sessions(config.session_ttl));
        let resets = MemoryStore::new(Keyspace::resets(config.reset_ttl));
        Self::with_stores(config, Arc::new(sessions), Arc::new(resets))
    }

    /// Creates state with the given session and reset stores.
    ///
    /// Users and messages are kept in memory; reset codes go to a
    /// [`LogMailer`].
    #[must_use]
    pub fn with_stores(
        config: Config,
        sessions: Arc<dyn StateStore>,
        resets: Arc<dyn StateStore>,
    ) -> Self {
        let notifier = Notifier::start(config.notifier());
        Self {
            config: Arc::new(config),
            sessions,
            resets,
            users: Arc::new(MemUserStore::new()),
            messages: Arc::new(MemMessageStore::new()),
            notifier,
            mailer: Arc::new(LogMailer),
            start_time: Instant::now(),
        }
    }

    /// Replaces the mailer.
    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Queues `event` for every connected WebSocket client.
    pub async fn publish(&self, event: Event) {
        debug!(event = event.kind(), "Publishing event");
        self.notifier.notify(event).await;
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("notifier", &self.notifier)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/v1/users", post(users::post_users).get(users::get_users))
        .route("/v1/users/me", get(users::get_me).patch(users::patch_me))
        .route("/v1/sessions", post(users::post_sessions))
        .route(
            "/v1/sessions/mine",
            axum::routing::delete(users::delete_session_mine),
        )
        .route(
            "/v1/channels",
            get(channels::get_channels).post(channels::post_channels),
        )
        .route(
            "/v1/channels/{id}",
            get(channels::get_channel)
                .patch(channels::patch_channel)
                .delete(channels::delete_channel),
        )
        .route(
            "/v1/channels/{id}/members",
            post(channels::post_member).delete(channels::delete_member),
        )
        .route("/v1/messages", post(channels::post_messages))
        .route(
            "/v1/messages/{id}",
            patch(channels::patch_message).delete(channels::delete_message),
        )
        .route("/v1/resetcodes", post(reset::post_resetcodes))
        .route("/v1/passwords/{email}", put(reset::put_password))
        .route("/v1/websocket", get(get_websocket))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors_layer())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // Path only: the query string may carry a bearer token.
                debug_span!(
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
        .with_state(state)
}

/// Browser clients need to read the bearer token off sign-up and sign-in
/// responses, so `Authorization` is exposed.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([AUTHORIZATION])
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Body for responses that only confirm an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
}

impl StatusMessage {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// Decodes a JSON request body, reporting failures as validation errors.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|err| ServerError::validation(format!("invalid JSON: {err}")))
}

/// Authenticates a request, returning its token and session state.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(SignedToken, SessionState)> {
    let (token, session) =
        session::get_state(headers, &state.config.session_key, state.sessions.as_ref()).await?;
    Ok((token, session))
}

/// Best-effort address of the caller, preferring the proxy header.
fn client_addr(headers: &HeaderMap, extensions: &Extensions) -> String {
    let forwarded = headers
        .get(HEADER_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if let Some(addr) = forwarded {
        return addr.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// GET /v1/websocket - Event Stream
// ============================================================================

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    /// Bearer token, for clients that cannot set headers.
    pub auth: Option<String>,
}

/// GET /v1/websocket - Upgrades an authenticated request to a WebSocket.
///
/// The connection only receives: every event queued after registration is
/// pushed as one text frame. Frames sent by the client are read and
/// discarded until it closes.
///
/// # Responses
///
/// - `101 Switching Protocols` - Client registered with the notifier
/// - `400 Bad Request` - No token, or not a Bearer header
/// - `401 Unauthorized` - Token invalid or session expired
async fn get_websocket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsQueryParams>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let key = &state.config.session_key;
    let token = match params.auth.as_deref().filter(|t| !t.is_empty()) {
        Some(raw) => SignedToken::parse(raw, key).map_err(SessionError::InvalidToken)?,
        None => session::session_id(&headers, key)?,
    };
    let session: SessionState = session::state_for_token(&token, state.sessions.as_ref()).await?;

    info!(user_id = %session.user.id, "WebSocket client connecting");

    let notifier = state.notifier.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let id = notifier.add_client(sink, stream).await;
        debug!(client_id = %id, user_id = %session.user.id, "WebSocket client registered");
    }))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of registered WebSocket clients.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.notifier.client_count().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::mail::testing::RecordingMailer;
    use crate::token::SigningKey;

    pub const TEST_KEY: &str = "router-test-signing-key";

    pub fn test_config() -> Config {
        let mut config = Config::new(SigningKey::new(TEST_KEY));
        config.bcrypt_cost = 4;
        config
    }

    /// State with a recording mailer, plus the mailer itself.
    pub fn test_state() -> (AppState, RecordingMailer) {
        let mailer = RecordingMailer::default();
        let state = AppState::new(test_config()).with_mailer(Arc::new(mailer.clone()));
        (state, mailer)
    }

    pub struct TestResponse {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Value,
    }

    impl TestResponse {
        pub fn bearer(&self) -> String {
            self.headers
                .get(AUTHORIZATION)
                .expect("no Authorization header")
                .to_str()
                .unwrap()
                .to_string()
        }
    }

    /// Sends one request. `auth` is the full `Authorization` header value.
    pub async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        auth: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Signs up `user_name` and returns the bearer header value and user JSON.
    pub async fn sign_up(app: &Router, user_name: &str) -> (String, Value) {
        let response = send(
            app,
            Method::POST,
            "/v1/users",
            None,
            Some(json!({
                "email": format!("{user_name}@example.com"),
                "password": "password",
                "passwordConf": "password",
                "userName": user_name,
                "firstName": "Test",
                "lastName": user_name,
            })),
        )
        .await;
        assert_eq!(response.status, StatusCode::CREATED, "{:?}", response.body);
        (response.bearer(), response.body)
    }
}

// ============================================================================
// Tests
// ============================================================================
