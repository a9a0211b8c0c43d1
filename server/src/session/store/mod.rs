//! Key/value backends for session state and reset codes.
//!
//! A [`StateStore`] holds opaque JSON payloads under string keys with a
//! time-to-live. Each store instance is bound to a [`Keyspace`] which fixes
//! the key prefix and the expiry policy:
//!
//! - sessions live under `sid:` and their TTL slides forward on every read
//! - reset codes live under `token:` with a fixed TTL that reads never extend
//!
//! Two backends are provided: [`MemoryStore`] for tests and single-process
//! deployments, and [`RedisStore`] for production.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use piper_server::session::store::{Keyspace, MemoryStore, StateStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = MemoryStore::new(Keyspace::sessions(Duration::from_secs(60)));
//! store.save("abc", "{\"user\":\"alice\"}".to_string()).await.unwrap();
//! assert_eq!(store.get("abc").await.unwrap(), "{\"user\":\"alice\"}");
//! # }
//! ```

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryStore, DEFAULT_MAX_CAPACITY};
pub use redis_store::RedisStore;

/// Key prefix for session state.
pub const SESSION_PREFIX: &str = "sid:";

/// Key prefix for password reset codes.
pub const RESET_PREFIX: &str = "token:";

/// Errors returned by a [`StateStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No live entry exists for the key.
    #[error("state not found or expired")]
    NotFound,

    /// The in-memory store refused a new key.
    #[error("state store at maximum capacity ({max_capacity} entries)")]
    AtCapacity {
        /// The maximum number of entries allowed.
        max_capacity: usize,
    },

    /// The backing service failed.
    #[error("state store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns true if the key was simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Prefix and expiry policy shared by every key in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    /// Prepended to every key before it reaches the backend.
    pub prefix: String,

    /// Lifetime of an entry after it is saved.
    pub ttl: Duration,

    /// Whether a successful read pushes expiry out by another `ttl`.
    pub sliding: bool,
}

impl Keyspace {
    /// Session keyspace: `sid:` prefix, sliding expiry.
    pub fn sessions(ttl: Duration) -> Self {
        Self {
            prefix: SESSION_PREFIX.to_string(),
            ttl,
            sliding: true,
        }
    }

    /// Reset-code keyspace: `token:` prefix, fixed expiry.
    pub fn resets(ttl: Duration) -> Self {
        Self {
            prefix: RESET_PREFIX.to_string(),
            ttl,
            sliding: false,
        }
    }

    /// Returns the backend key for `key`.
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// TTL in whole seconds, never less than one.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

/// A shared key/value service with expiry.
///
/// Implementations must be safe to call concurrently. Writes to the same key
/// are last-write-wins; there is no ordering between different keys.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stores `payload` under `key`, replacing any previous value and
    /// restarting its TTL.
    async fn save(&self, key: &str, payload: String) -> Result<(), StoreError>;

    /// Returns the payload stored under `key`.
    ///
    /// Returns [`StoreError::NotFound`] if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Removes `key` and returns the payload it held.
    ///
    /// Of several concurrent calls for the same key, at most one succeeds;
    /// the rest get [`StoreError::NotFound`].
    async fn take(&self, key: &str) -> Result<String, StoreError>;
}
