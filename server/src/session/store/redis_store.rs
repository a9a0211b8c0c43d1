//! Redis-backed [`StateStore`].
//!
//! Saves use `SETEX` so the server owns every TTL. For sliding keyspaces a
//! read pipelines `GET` and `EXPIRE` so fetching and refreshing a session
//! costs one round trip. [`StateStore::take`] runs `GET` and `DEL` in one
//! `MULTI` block.
//!
//! Every operation shares one multiplexed connection, opened on first use
//! and reopened after an I/O failure.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{Keyspace, StateStore, StoreError};

/// State store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    keyspace: Keyspace,
}

impl RedisStore {
    /// Creates a store for the server at `addr` (`redis://host:port/db`).
    ///
    /// No connection is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if `addr` is not a valid Redis URL.
    pub fn open(addr: &str, keyspace: Keyspace) -> Result<Self, StoreError> {
        let client = redis::Client::open(addr)?;
        debug!(
            prefix = %keyspace.prefix,
            ttl_secs = keyspace.ttl_secs(),
            sliding = keyspace.sliding,
            "Created Redis state store"
        );
        Ok(Self::with_client(Arc::new(client), keyspace))
    }

    /// Creates a store sharing an existing client, so several keyspaces can
    /// use one server.
    pub fn with_client(client: Arc<redis::Client>, keyspace: Keyspace) -> Self {
        Self {
            client,
            conn: Arc::new(Mutex::new(None)),
            keyspace,
        }
    }

    /// Returns the keyspace this store was created with.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Returns a handle to the shared connection, opening it if needed.
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_tokio_connection().await?;
        debug!(prefix = %self.keyspace.prefix, "Opened Redis connection");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Converts a command error, forgetting the connection if it broke.
    async fn command_failed(&self, err: RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() {
            warn!(prefix = %self.keyspace.prefix, error = %err, "Redis connection lost");
            *self.conn.lock().await = None;
        }
        err.into()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn save(&self, key: &str, payload: String) -> Result<(), StoreError> {
        let key = self.keyspace.key(key);
        let mut conn = self.connection().await?;

        let result = redis::cmd("SETEX")
            .arg(&key)
            .arg(self.keyspace.ttl_secs())
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await;
        if let Err(err) = result {
            return Err(self.command_failed(err).await);
        }

        trace!(prefix = %self.keyspace.prefix, "Saved state to Redis");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let key = self.keyspace.key(key);
        let mut conn = self.connection().await?;

        let result: Result<Option<String>, RedisError> = if self.keyspace.sliding {
            redis::pipe()
                .cmd("GET")
                .arg(&key)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.keyspace.ttl_secs())
                .ignore()
                .query_async::<_, (Option<String>,)>(&mut conn)
                .await
                .map(|(payload,)| payload)
        } else {
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        };

        match result {
            Ok(payload) => payload.ok_or(StoreError::NotFound),
            Err(err) => Err(self.command_failed(err).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = self.keyspace.key(key);
        let mut conn = self.connection().await?;

        let result = redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, ()>(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.command_failed(err).await),
        }
    }

    async fn take(&self, key: &str) -> Result<String, StoreError> {
        let key = self.keyspace.key(key);
        let mut conn = self.connection().await?;

        let result = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(&key)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async::<_, (Option<String>,)>(&mut conn)
            .await;

        match result {
            Ok((payload,)) => payload.ok_or(StoreError::NotFound),
            Err(err) => Err(self.command_failed(err).await),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("keyspace", &self.keyspace)
            .finish_non_exhaustive()
    }
}
