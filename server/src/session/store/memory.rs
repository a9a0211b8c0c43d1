//! In-memory [`StateStore`] with per-entry expiry.
//!
//! Entries expire lazily when read and in bulk through
//! [`MemoryStore::cleanup_expired`], which [`MemoryStore::spawn_cleanup_task`]
//! calls on an interval. The number of live keys is bounded so an unauthenticated
//! caller cannot grow the map without limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::{Keyspace, StateStore, StoreError};

/// Default bound on stored entries.
pub const DEFAULT_MAX_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    payload: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Thread-safe in-memory state store.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    keyspace: Keyspace,
    max_capacity: usize,
}

impl MemoryStore {
    /// Creates an empty store with [`DEFAULT_MAX_CAPACITY`].
    pub fn new(keyspace: Keyspace) -> Self {
        Self::with_capacity(keyspace, DEFAULT_MAX_CAPACITY)
    }

    /// Creates an empty store bounded to `max_capacity` entries.
    pub fn with_capacity(keyspace: Keyspace, max_capacity: usize) -> Self {
        debug!(
            prefix = %keyspace.prefix,
            ttl_secs = keyspace.ttl.as_secs(),
            sliding = keyspace.sliding,
            max_capacity,
            "Creating in-memory state store"
        );
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            keyspace,
            max_capacity,
        }
    }

    /// Returns the keyspace this store was created with.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Number of entries held, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!(
                prefix = %self.keyspace.prefix,
                removed_count = removed,
                remaining_count = entries.len(),
                "Cleaned up expired state"
            );
        }

        removed
    }

    /// Spawns a task that calls [`cleanup_expired`](Self::cleanup_expired)
    /// every `cleanup_interval`.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                store.cleanup_expired().await;
            }
        })
    }

    async fn remove_if_expired(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(Instant::now()))
        {
            entries.remove(key);
            trace!(prefix = %self.keyspace.prefix, "Removed expired state during read");
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, key: &str, payload: String) -> Result<(), StoreError> {
        let key = self.keyspace.key(key);
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_capacity {
            // Expired entries still count until swept.
            entries.retain(|_, entry| !entry.is_expired(now));
        }

        if !entries.contains_key(&key) && entries.len() >= self.max_capacity {
            warn!(
                prefix = %self.keyspace.prefix,
                max_capacity = self.max_capacity,
                "State store at capacity, rejecting new entry"
            );
            return Err(StoreError::AtCapacity {
                max_capacity: self.max_capacity,
            });
        }

        entries.insert(
            key,
            Entry {
                payload,
                expires_at: now + self.keyspace.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let key = self.keyspace.key(key);
        let now = Instant::now();

        if self.keyspace.sliding {
            let mut entries = self.entries.write().await;
            return match entries.get_mut(&key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.expires_at = now + self.keyspace.ttl;
                    Ok(entry.payload.clone())
                }
                Some(_) => {
                    entries.remove(&key);
                    Err(StoreError::NotFound)
                }
                None => Err(StoreError::NotFound),
            };
        }

        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if !entry.is_expired(now) => return Ok(entry.payload.clone()),
                Some(_) => {}
                None => return Err(StoreError::NotFound),
            }
        }

        self.remove_if_expired(&key).await;
        Err(StoreError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = self.keyspace.key(key);
        self.entries.write().await.remove(&key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<String, StoreError> {
        let key = self.keyspace.key(key);
        let now = Instant::now();

        match self.entries.write().await.remove(&key) {
            Some(entry) if !entry.is_expired(now) => Ok(entry.payload),
            _ => Err(StoreError::NotFound),
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.try_read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("MemoryStore")
            .field("entry_count", &len)
            .field("keyspace", &self.keyspace)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}
