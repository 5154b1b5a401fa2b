//! Durable record of which partitions are believed loaded.
//!
//! Each tracked partition is one JSON value in a [`KeyValueStore`] under
//! `{prefix}:{collection}:{partition}`:
//!
//! ```json
//! {"collection":"collection_acme","partition":"bot_123",
//!  "loaded_at":"2026-01-01T00:00:00Z","last_access_at":"2026-01-01T00:05:00Z"}
//! ```
//!
//! Every write refreshes the entry's TTL, so a record only disappears on
//! its own if the partition goes untouched for longer than the record TTL.
//! The records are a belief, not a guarantee: the partition cache rewrites
//! them from the vector store's live state at startup.

use std::sync::Arc;
use std::time::Duration;

use ragsync_core::clock::Clock;
use ragsync_core::kv::KeyValueStore;
use ragsync_core::models::PartitionRecord;
use ragsync_core::{Result, SyncError};

pub struct PartitionStateStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    record_ttl: Duration,
}

impl PartitionStateStore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        record_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            clock,
            prefix: prefix.into(),
            record_ttl,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn key(&self, collection: &str, partition: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, partition)
    }

    fn encode(record: &PartitionRecord) -> Result<String> {
        serde_json::to_string(record)
            .map_err(|e| SyncError::terminal("kv", format!("encode partition record: {}", e)))
    }

    async fn write(&self, record: &PartitionRecord) -> Result<()> {
        self.kv
            .set_with_ttl(
                &self.key(&record.collection, &record.partition),
                &Self::encode(record)?,
                self.record_ttl,
            )
            .await
    }

    fn decode(key: &str, value: &str) -> Option<PartitionRecord> {
        match serde_json::from_str(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring unreadable partition record");
                None
            }
        }
    }

    /// Record a partition as loaded now.
    ///
    /// Without `force`, an existing record is left untouched and `false` is
    /// returned.
    pub async fn mark_loaded(&self, collection: &str, partition: &str, force: bool) -> Result<bool> {
        if !force && self.get(collection, partition).await?.is_some() {
            return Ok(false);
        }
        let now = self.clock.now();
        self.write(&PartitionRecord {
            collection: collection.to_string(),
            partition: partition.to_string(),
            loaded_at: now,
            last_access_at: now,
        })
        .await?;
        Ok(true)
    }

    /// Bump `last_access_at` to now. Returns `false` if the partition is not
    /// tracked.
    ///
    /// Never recreates a record removed between the read and the write, so
    /// a concurrent eviction always wins. The access time never moves
    /// backwards, even if the clock does.
    pub async fn touch(&self, collection: &str, partition: &str) -> Result<bool> {
        let Some(mut record) = self.get(collection, partition).await? else {
            return Ok(false);
        };
        record.last_access_at = record.last_access_at.max(self.clock.now());
        self.kv
            .replace_with_ttl(
                &self.key(collection, partition),
                &Self::encode(&record)?,
                self.record_ttl,
            )
            .await
    }

    pub async fn get(&self, collection: &str, partition: &str) -> Result<Option<PartitionRecord>> {
        let key = self.key(collection, partition);
        Ok(self
            .kv
            .get(&key)
            .await?
            .and_then(|value| Self::decode(&key, &value)))
    }

    pub async fn is_loaded(&self, collection: &str, partition: &str) -> Result<bool> {
        Ok(self.get(collection, partition).await?.is_some())
    }

    pub async fn remove(&self, collection: &str, partition: &str) -> Result<bool> {
        self.kv.delete(&self.key(collection, partition)).await
    }

    /// Every tracked partition.
    pub async fn list(&self) -> Result<Vec<PartitionRecord>> {
        self.scan(&format!("{}:", self.prefix)).await
    }

    /// Tracked partitions of one collection.
    pub async fn list_collection(&self, collection: &str) -> Result<Vec<PartitionRecord>> {
        self.scan(&format!("{}:{}:", self.prefix, collection)).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<PartitionRecord>> {
        Ok(self
            .kv
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .filter_map(|(key, value)| Self::decode(&key, &value))
            .collect())
    }
}
