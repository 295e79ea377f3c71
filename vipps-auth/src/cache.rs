//! Time-bounded key/value store for short-lived secrets.
//!
//! Holds PKCE verifiers (keyed by the per-attempt state key) and the cached discovery
//! document. Keys are namespaced by random state keys, so entries never collide across
//! users and no lock beyond the map's own sharding is needed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Trait for ephemeral secret storage with per-entry expiry.
///
/// Implementations may be process-local (see [`MemoryStore`]) or backed by a shared
/// cache when the application runs on several nodes.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Store `value` under `key` for `ttl`. Overwrites any existing entry.
    async fn set(&self, key: &str, value: String, ttl: Duration);

    /// Read an entry without consuming it. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Option<String>;

    /// Read and remove an entry. Expired entries read as `None`.
    async fn take(&self, key: &str) -> Option<String>;

    /// Remove an entry if present.
    async fn delete(&self, key: &str);
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// In-process store backed by a concurrent map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries.
    ///
    /// Lookups already ignore expired entries; call this periodically to bound memory
    /// when many login attempts are abandoned.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let expires_at = Utc::now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    async fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    async fn take(&self, key: &str) -> Option<String> {
        let (_, entry) = self.entries.remove(key)?;
        entry.is_live(Utc::now()).then_some(entry.value)
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}
