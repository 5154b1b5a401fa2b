//! In-memory [`KeyValueStore`] with TTL expiry driven by a [`Clock`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};

use super::KeyValueStore;

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory key-value store.
///
/// Expired entries are invisible to reads and are dropped lazily on write.
pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn raw_len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SyncError::InvalidInput(format!("ttl out of range: {}", e)))?;
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn replace_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SyncError::InvalidInput(format!("ttl out of range: {}", e)))?;
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.value = value.to_string();
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .remove(key)
            .map(|e| e.expires_at > now)
            .unwrap_or(false))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }
}
