//! Session directory: bearer tokens bound to per-session state.
//!
//! A session begins when [`begin_session`] mints a [`SignedToken`] and saves
//! the caller's state under it. Clients present the token on later requests
//! as `Authorization: Bearer <token>`; [`get_state`] verifies it, refreshes
//! the session's TTL and returns a copy of the state. Changes to that copy
//! are only kept if written back with [`save_state`]. [`end_session`] signs
//! out.
//!
//! State is stored as JSON, so any `Serialize + DeserializeOwned` type can be
//! used; the handlers use [`SessionState`].
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use axum::http::HeaderMap;
//! use piper_server::session::{self, store::{Keyspace, MemoryStore}};
//! use piper_server::token::SigningKey;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let key = SigningKey::new("an example signing key");
//! let store = MemoryStore::new(Keyspace::sessions(Duration::from_secs(60)));
//!
//! let token = session::begin_session(&key, &store, &"alice".to_string()).await.unwrap();
//!
//! let mut headers = HeaderMap::new();
//! let (name, value) = session::authorization_header(&token).unwrap();
//! headers.insert(name, value);
//!
//! let (_, user): (_, String) = session::get_state(&headers, &key, &store).await.unwrap();
//! assert_eq!(user, "alice");
//! # }
//! ```

pub mod store;

use axum::http::header::{HeaderName, AUTHORIZATION};
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::models::users::User;
use crate::token::{SignedToken, SigningKey, TokenError};

use self::store::{StateStore, StoreError};

/// Authorization scheme prefix, including the separating space.
pub const SCHEME_BEARER: &str = "Bearer ";

/// Errors from the session directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The request carried no `Authorization` header.
    #[error("no authorization header")]
    NoHeader,

    /// The `Authorization` header does not use the `Bearer` scheme.
    #[error("authorization scheme must be Bearer")]
    BadScheme,

    /// The bearer token failed to parse or verify.
    #[error("invalid session token: {0}")]
    InvalidToken(#[source] TokenError),

    /// The token is valid but no session exists for it.
    #[error("session not found or expired")]
    NotFound,

    /// A new session token could not be minted.
    #[error("could not mint session token: {0}")]
    Mint(#[source] TokenError),

    /// Session state could not be encoded or decoded.
    #[error("session state serialization failed: {0}")]
    Serialization(String),

    /// The state store failed.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

/// State kept for every signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub began_at: DateTime<Utc>,
    pub client_addr: String,
    pub user: User,
}

impl SessionState {
    pub fn new(user: User, client_addr: impl Into<String>) -> Self {
        Self {
            began_at: Utc::now(),
            client_addr: client_addr.into(),
            user,
        }
    }
}

/// Mints a token, saves `state` under it and returns the token.
pub async fn begin_session<S>(
    key: &SigningKey,
    store: &dyn StateStore,
    state: &S,
) -> Result<SignedToken, SessionError>
where
    S: Serialize + Sync + ?Sized,
{
    let token = SignedToken::mint(key).map_err(SessionError::Mint)?;
    save_state(&token, store, state).await?;
    debug!("Began session");
    Ok(token)
}

/// Overwrites the state stored for `token`, restarting its TTL.
pub async fn save_state<S>(
    token: &SignedToken,
    store: &dyn StateStore,
    state: &S,
) -> Result<(), SessionError>
where
    S: Serialize + Sync + ?Sized,
{
    let payload =
        serde_json::to_string(state).map_err(|err| SessionError::Serialization(err.to_string()))?;
    store.save(token.as_str(), payload).await?;
    Ok(())
}

/// Loads the state stored for an already-verified `token`.
pub async fn state_for_token<S>(
    token: &SignedToken,
    store: &dyn StateStore,
) -> Result<S, SessionError>
where
    S: DeserializeOwned,
{
    let payload = store.get(token.as_str()).await?;
    serde_json::from_str(&payload).map_err(|err| SessionError::Serialization(err.to_string()))
}

/// Verifies the token in an `Authorization` header value.
pub fn parse_bearer(value: &str, key: &SigningKey) -> Result<SignedToken, SessionError> {
    let token = value
        .strip_prefix(SCHEME_BEARER)
        .ok_or(SessionError::BadScheme)?;
    SignedToken::parse(token.trim(), key).map_err(SessionError::InvalidToken)
}

/// Extracts and verifies the bearer token of a request.
///
/// Touches no store, so a malformed header never costs a round trip.
pub fn session_id(headers: &HeaderMap, key: &SigningKey) -> Result<SignedToken, SessionError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(SessionError::NoHeader)?
        .to_str()
        .map_err(|_| SessionError::BadScheme)?;
    parse_bearer(value, key)
}

/// Authenticates a request and returns its token and session state.
///
/// Refreshes the session TTL when the store's keyspace slides.
pub async fn get_state<S>(
    headers: &HeaderMap,
    key: &SigningKey,
    store: &dyn StateStore,
) -> Result<(SignedToken, S), SessionError>
where
    S: DeserializeOwned,
{
    let token = session_id(headers, key)?;
    let state = state_for_token(&token, store).await?;
    trace!("Loaded session state");
    Ok((token, state))
}

/// Signs out: verifies the request's token and deletes its session.
pub async fn end_session(
    headers: &HeaderMap,
    key: &SigningKey,
    store: &dyn StateStore,
) -> Result<SignedToken, SessionError> {
    let token = session_id(headers, key)?;
    store.delete(token.as_str()).await?;
    debug!("Ended session");
    Ok(token)
}

/// The `Authorization` header that hands `token` to a client.
pub fn authorization_header(
    token: &SignedToken,
) -> Result<(HeaderName, HeaderValue), SessionError> {
    let value = HeaderValue::from_str(&format!("{SCHEME_BEARER}{token}"))
        .map_err(|_| SessionError::InvalidToken(TokenError::InvalidFormat))?;
    Ok((AUTHORIZATION, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use store::{Keyspace, MemoryStore};

    fn key() -> SigningKey {
        SigningKey::new("session-test-key")
    }

    fn store() -> MemoryStore {
        MemoryStore::new(Keyspace::sessions(Duration::from_secs(60)))
    }

    fn headers_for(token: &SignedToken) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let (name, value) = authorization_header(token).unwrap();
        headers.insert(name, value);
        headers
    }

    fn raw_header(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Demo {
        user: String,
        visits: u32,
    }

    /// Counts every call so tests can assert the store was never consulted.
    #[derive(Default)]
    struct CountingStore {
        inner: Option<MemoryStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for CountingStore {
        async fn save(&self, key: &str, payload: String) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.inner {
                Some(s) => s.save(key, payload).await,
                None => Ok(()),
            }
        }

        async fn get(&self, key: &str) -> Result<String, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.inner {
                Some(s) => s.get(key).await,
                None => Err(StoreError::NotFound),
            }
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.inner {
                Some(s) => s.delete(key).await,
                None => Ok(()),
            }
        }

        async fn take(&self, key: &str) -> Result<String, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.inner {
                Some(s) => s.take(key).await,
                None => Err(StoreError::NotFound),
            }
        }
    }

    #[tokio::test]
    async fn begin_then_get_round_trips_state() {
        let (key, store) = (key(), store());
        let state = Demo {
            user: "alice".into(),
            visits: 1,
        };

        let token = begin_session(&key, &store, &state).await.unwrap();
        let (got_token, got): (SignedToken, Demo) =
            get_state(&headers_for(&token), &key, &store).await.unwrap();

        assert_eq!(got_token, token);
        assert_eq!(got, state);
    }

    #[tokio::test]
    async fn get_state_without_header_is_no_header() {
        let result: Result<(SignedToken, Demo), _> =
            get_state(&HeaderMap::new(), &key(), &store()).await;
        assert_eq!(result.unwrap_err(), SessionError::NoHeader);
    }

    #[tokio::test]
    async fn bad_scheme_never_reaches_store() {
        let store = CountingStore::default();
        let result: Result<(SignedToken, Demo), _> =
            get_state(&raw_header("garbagevalue"), &key(), &store).await;

        assert_eq!(result.unwrap_err(), SessionError::BadScheme);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scheme_is_case_sensitive() {
        let token = SignedToken::mint(&key()).unwrap();
        let result = session_id(&raw_header(&format!("bearer {token}")), &key());
        assert_eq!(result.unwrap_err(), SessionError::BadScheme);
    }

    #[tokio::test]
    async fn forged_token_is_invalid_and_never_reaches_store() {
        let store = CountingStore::default();
        let forged = SignedToken::mint(&SigningKey::new("attacker")).unwrap();
        let result: Result<(SignedToken, Demo), _> =
            get_state(&headers_for(&forged), &key(), &store).await;

        assert_eq!(
            result.unwrap_err(),
            SessionError::InvalidToken(TokenError::InvalidSignature)
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let token = SignedToken::mint(&key()).unwrap();
        let result: Result<(SignedToken, Demo), _> =
            get_state(&headers_for(&token), &key(), &store()).await;
        assert_eq!(result.unwrap_err(), SessionError::NotFound);
    }

    #[tokio::test]
    async fn end_session_then_get_is_not_found() {
        let (key, store) = (key(), store());
        let token = begin_session(&key, &store, &"alice").await.unwrap();
        let headers = headers_for(&token);

        let ended = end_session(&headers, &key, &store).await.unwrap();
        assert_eq!(ended, token);

        let result: Result<(SignedToken, String), _> = get_state(&headers, &key, &store).await;
        assert_eq!(result.unwrap_err(), SessionError::NotFound);
    }

    #[tokio::test]
    async fn save_state_persists_changes() {
        let (key, store) = (key(), store());
        let mut state = Demo {
            user: "alice".into(),
            visits: 1,
        };
        let token = begin_session(&key, &store, &state).await.unwrap();

        state.visits = 2;
        save_state(&token, &store, &state).await.unwrap();

        let got: Demo = state_for_token(&token, &store).await.unwrap();
        assert_eq!(got.visits, 2);
    }

    #[tokio::test]
    async fn mismatched_state_shape_is_serialization_error() {
        let (key, store) = (key(), store());
        let token = begin_session(&key, &store, &"just a string").await.unwrap();
        let result: Result<Demo, _> = state_for_token(&token, &store).await;
        assert!(matches!(result, Err(SessionError::Serialization(_))));
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let key = key();
        let store = MemoryStore::with_capacity(Keyspace::sessions(Duration::from_secs(60)), 0);
        let result = begin_session(&key, &store, &"alice").await;
        assert_eq!(
            result.unwrap_err(),
            SessionError::Store(StoreError::AtCapacity { max_capacity: 0 })
        );
    }

    #[tokio::test]
    async fn tokens_are_stored_under_session_prefix() {
        let key = key();
        let counting = CountingStore {
            inner: Some(store()),
            calls: AtomicUsize::new(0),
        };
        let token = begin_session(&key, &counting, &"alice").await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        let inner = counting.inner.as_ref().unwrap();
        assert_eq!(inner.keyspace().key(token.as_str()), format!("sid:{token}"));
    }

    #[test]
    fn authorization_header_uses_bearer_scheme() {
        let token = SignedToken::mint(&key()).unwrap();
        let (name, value) = authorization_header(&token).unwrap();
        assert_eq!(name, AUTHORIZATION);
        assert_eq!(value.to_str().unwrap(), format!("Bearer {token}"));
    }

    #[test]
    fn session_state_uses_client_field_names() {
        let user: User = serde_json::from_value(serde_json::json!({
            "id": "u1",
            "email": "alice@example.com",
            "userName": "alice",
            "firstName": "",
            "lastName": "",
            "photoURL": ""
        }))
        .unwrap();
        let state = SessionState::new(user, "127.0.0.1");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["clientAddr"], "127.0.0.1");
        assert_eq!(json["user"]["userName"], "alice");
        assert!(json.get("beganAt").is_some());
    }
}
