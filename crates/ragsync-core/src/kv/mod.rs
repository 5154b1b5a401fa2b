//! Key-value store abstraction used for durable partition tracking.
//!
//! Values are opaque strings; every write carries a TTL after which the
//! entry is treated as absent. Keys are hierarchical (`prefix:collection:partition`)
//! so a prefix scan enumerates one namespace.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Write `value` under `key`, replacing any previous value and TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Overwrite `key` only if it holds a live entry. Returns `false`, and
    /// writes nothing, when the key is absent or expired.
    async fn replace_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read a live (non-expired) value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Returns `true` if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}
