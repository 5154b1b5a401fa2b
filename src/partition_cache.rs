//! Partition lifecycle cache.
//!
//! Guarantees a vector-store partition is loaded before anything reads or
//! writes it, while keeping the set of loaded partitions bounded.
//!
//! # Loading
//!
//! [`PartitionCache::ensure_loaded`] has two paths:
//!
//! - **Fast path:** the partition is tracked as loaded, so its access time
//!   is bumped and no vector-store call is made.
//! - **Slow path:** the per-partition async lock is taken, the tracked state
//!   is re-checked (another caller may have finished the load while this one
//!   waited), and only then is exactly this partition loaded. Callers for
//!   different partitions never contend on the same lock; the number of
//!   concurrent load calls overall is capped by a semaphore.
//!
//! # Eviction
//!
//! [`PartitionCache::run_eviction_loop`] wakes every cleanup interval and
//! runs two passes:
//!
//! | Pass | Evicts |
//! |------|--------|
//! | TTL | every partition idle for longer than the TTL |
//! | Memory | while utilization is above threshold, the oldest quartile by last access (at least one), stopping as soon as utilization drops below |
//!
//! # Startup
//!
//! Tracking records and the vector store are durable independently and can
//! disagree after a crash. [`PartitionCache::resync`] rewrites the records
//! from the vector store's live load state. [`PartitionCache::reload_tracked`]
//! goes the other way for a vector store that restarted empty.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use ragsync_core::models::{LoadState, PartitionKey, PartitionRecord};
use ragsync_core::vector::VectorStore;
use ragsync_core::{ErrorKind, Result, SyncError};

use crate::config::PartitionConfig;
use crate::memory::MemoryProbe;
use crate::partition_state::PartitionStateStore;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub memory_threshold_percent: f64,
    pub cleanup_interval: Duration,
    pub max_concurrent_loads: usize,
}

impl CacheSettings {
    pub fn from_config(config: &PartitionConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_minutes * 60),
            memory_threshold_percent: config.memory_threshold_percent,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            max_concurrent_loads: config.max_concurrent_loads,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_config(&PartitionConfig::default())
    }
}

/// Partitions evicted by one cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub ttl_evicted: Vec<PartitionKey>,
    pub memory_evicted: Vec<PartitionKey>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResyncReport {
    pub collections_checked: usize,
    pub partitions_checked: usize,
    pub partitions_synced: usize,
    pub stale_records_removed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub reloaded: Vec<PartitionKey>,
    pub already_loaded: usize,
    /// Records dropped because their collection or partition no longer exists.
    pub dropped: Vec<PartitionKey>,
    pub failed: Vec<(PartitionKey, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OldestPartition {
    pub key: PartitionKey,
    pub last_access_at: DateTime<Utc>,
    pub minutes_idle: i64,
}

/// Snapshot of tracked partitions for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub total_loaded: usize,
    pub collections: Vec<String>,
    pub oldest: Option<OldestPartition>,
    pub partitions: Vec<PartitionRecord>,
    pub ttl_minutes: u64,
    pub cleanup_interval_seconds: u64,
    pub memory_threshold_percent: f64,
}

impl PartitionStatus {
    pub fn from_records(
        records: Vec<PartitionRecord>,
        now: DateTime<Utc>,
        settings: &CacheSettings,
    ) -> Self {
        let collections: BTreeSet<String> =
            records.iter().map(|r| r.collection.clone()).collect();
        let oldest = records
            .iter()
            .min_by_key(|r| r.last_access_at)
            .map(|r| OldestPartition {
                key: r.key(),
                last_access_at: r.last_access_at,
                minutes_idle: r.idle_for(now).num_minutes(),
            });
        Self {
            total_loaded: records.len(),
            collections: collections.into_iter().collect(),
            oldest,
            partitions: records,
            ttl_minutes: settings.ttl.as_secs() / 60,
            cleanup_interval_seconds: settings.cleanup_interval.as_secs(),
            memory_threshold_percent: settings.memory_threshold_percent,
        }
    }
}

pub struct PartitionCache {
    vectors: Arc<dyn VectorStore>,
    state: PartitionStateStore,
    memory: Arc<dyn MemoryProbe>,
    settings: CacheSettings,
    locks: Mutex<HashMap<PartitionKey, Arc<AsyncMutex<()>>>>,
    load_slots: Semaphore,
}

impl PartitionCache {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        state: PartitionStateStore,
        memory: Arc<dyn MemoryProbe>,
        settings: CacheSettings,
    ) -> Self {
        let slots = settings.max_concurrent_loads.max(1);
        Self {
            vectors,
            state,
            memory,
            settings,
            locks: Mutex::new(HashMap::new()),
            load_slots: Semaphore::new(slots),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn state(&self) -> &PartitionStateStore {
        &self.state
    }

    /// The lock for one key, created on first use and kept for the life of
    /// the cache.
    fn lock_for(&self, collection: &str, partition: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(PartitionKey::new(collection, partition))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Make sure `partition` of `collection` is loaded.
    ///
    /// Returns `false` when the collection does not exist or the load call
    /// failed; the failure is logged here and not retried.
    pub async fn ensure_loaded(&self, collection: &str, partition: &str, force_reload: bool) -> bool {
        if !force_reload {
            match self.state.touch(collection, partition).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    collection,
                    partition,
                    error = %e,
                    "partition state read failed, taking slow path"
                ),
            }
        }

        let lock = self.lock_for(collection, partition);
        let _guard = lock.lock().await;

        if !force_reload {
            if let Ok(true) = self.state.touch(collection, partition).await {
                tracing::debug!(collection, partition, "partition loaded by concurrent caller");
                return true;
            }
        }

        match self.load(collection, partition).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(collection, partition, error = %e, "partition load failed");
                false
            }
        }
    }

    /// Issue the load. Caller holds the key's lock.
    async fn load(&self, collection: &str, partition: &str) -> Result<bool> {
        if self.vectors.get_load_state(collection, None).await? == LoadState::NotExist {
            tracing::warn!(collection, partition, "collection does not exist");
            return Ok(false);
        }

        let _slot = self
            .load_slots
            .acquire()
            .await
            .map_err(|_| SyncError::terminal("vector", "load slots closed"))?;

        let started = Instant::now();
        self.vectors.load_partition(collection, partition).await?;

        if let Err(e) = self.state.mark_loaded(collection, partition, true).await {
            tracing::warn!(
                collection,
                partition,
                error = %e,
                "partition loaded but tracking record not written"
            );
        }
        tracing::info!(
            collection,
            partition,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "partition loaded"
        );
        Ok(true)
    }

    /// Release a partition from vector-store memory and stop tracking it.
    ///
    /// Safe on an already-released or dropped partition. Returns whether a
    /// tracking record was removed.
    pub async fn evict(&self, collection: &str, partition: &str) -> Result<bool> {
        let lock = self.lock_for(collection, partition);
        let _guard = lock.lock().await;
        self.evict_locked(collection, partition).await
    }

    async fn evict_locked(&self, collection: &str, partition: &str) -> Result<bool> {
        match self.vectors.release_partition(collection, partition).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(collection, partition, "partition already gone");
            }
            Err(e) => return Err(e),
        }
        let was_tracked = self.state.remove(collection, partition).await?;
        tracing::info!(collection, partition, was_tracked, "partition evicted");
        Ok(was_tracked)
    }

    /// Evict only if the partition is still idle since `cutoff` once the
    /// lock is held.
    async fn evict_if_idle(
        &self,
        collection: &str,
        partition: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let lock = self.lock_for(collection, partition);
        let _guard = lock.lock().await;
        match self.state.get(collection, partition).await? {
            Some(record) if record.last_access_at < cutoff => {
                self.evict_locked(collection, partition).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop the tracking record without touching the vector store.
    pub async fn forget(&self, collection: &str, partition: &str) -> Result<bool> {
        let lock = self.lock_for(collection, partition);
        let _guard = lock.lock().await;
        self.state.remove(collection, partition).await
    }

    pub async fn is_tracked(&self, collection: &str, partition: &str) -> Result<bool> {
        self.state.is_loaded(collection, partition).await
    }

    /// TTL pass: evict partitions idle for longer than the TTL.
    pub async fn evict_expired(&self) -> Result<Vec<PartitionKey>> {
        let ttl = chrono::Duration::from_std(self.settings.ttl)
            .map_err(|e| SyncError::InvalidInput(format!("ttl out of range: {}", e)))?;
        let cutoff = self.state.clock().now() - ttl;

        let mut evicted = Vec::new();
        for record in self.state.list().await? {
            if record.last_access_at >= cutoff {
                continue;
            }
            match self
                .evict_if_idle(&record.collection, &record.partition, cutoff)
                .await
            {
                Ok(true) => evicted.push(record.key()),
                Ok(false) => {}
                Err(e) => tracing::error!(
                    partition = %record.key(),
                    error = %e,
                    "ttl eviction failed"
                ),
            }
        }
        Ok(evicted)
    }

    /// Memory pass: evict least-recently-used partitions while the host is
    /// above the memory threshold.
    pub async fn relieve_memory_pressure(&self) -> Result<Vec<PartitionKey>> {
        let threshold = self.settings.memory_threshold_percent;
        let usage = self.memory.utilization_percent();
        if usage <= threshold {
            return Ok(Vec::new());
        }

        let mut records = self.state.list().await?;
        records.sort_by_key(|r| r.last_access_at);
        let quota = (records.len() / 4).max(1);
        tracing::warn!(
            usage_percent = usage,
            threshold_percent = threshold,
            tracked = records.len(),
            quota,
            "memory pressure, evicting least recently used partitions"
        );

        let mut evicted = Vec::new();
        for record in records.into_iter().take(quota) {
            match self.evict(&record.collection, &record.partition).await {
                Ok(_) => evicted.push(record.key()),
                Err(e) => {
                    tracing::error!(partition = %record.key(), error = %e, "memory eviction failed");
                    continue;
                }
            }
            let usage = self.memory.utilization_percent();
            if usage < threshold {
                tracing::info!(usage_percent = usage, "memory back under threshold");
                break;
            }
        }
        Ok(evicted)
    }

    /// One TTL pass followed by one memory pass.
    pub async fn run_cleanup_pass(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        match self.evict_expired().await {
            Ok(keys) => report.ttl_evicted = keys,
            Err(e) => tracing::error!(error = %e, "ttl pass failed"),
        }
        match self.relieve_memory_pressure().await {
            Ok(keys) => report.memory_evicted = keys,
            Err(e) => tracing::error!(error = %e, "memory pass failed"),
        }
        report
    }

    /// Run cleanup passes every cleanup interval until `shutdown` fires.
    pub async fn run_eviction_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.settings.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        tracing::info!(
            interval_secs = self.settings.cleanup_interval.as_secs(),
            ttl_minutes = self.settings.ttl.as_secs() / 60,
            memory_threshold_percent = self.settings.memory_threshold_percent,
            "partition eviction loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                report = self.run_cleanup_pass() => {
                    if !report.ttl_evicted.is_empty() || !report.memory_evicted.is_empty() {
                        tracing::info!(
                            ttl_evicted = report.ttl_evicted.len(),
                            memory_evicted = report.memory_evicted.len(),
                            "cleanup pass finished"
                        );
                    }
                }
            }
        }
        tracing::info!("partition eviction loop stopped");
    }

    /// Rewrite tracking records from the vector store's live load state.
    pub async fn resync(&self) -> Result<ResyncReport> {
        let started = Instant::now();
        let mut report = ResyncReport::default();

        let collections: Vec<String> = self
            .vectors
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| !c.starts_with('_'))
            .collect();

        for collection in &collections {
            let partitions: Vec<String> = match self.vectors.list_partitions(collection).await {
                Ok(parts) => parts.into_iter().filter(|p| p != "_default").collect(),
                Err(e) => {
                    tracing::error!(collection, error = %e, "listing partitions failed");
                    continue;
                }
            };
            report.collections_checked += 1;

            for partition in &partitions {
                report.partitions_checked += 1;
                match self.vectors.get_load_state(collection, Some(partition)).await {
                    Ok(LoadState::Loaded | LoadState::Loading) => {
                        match self.state.mark_loaded(collection, partition, true).await {
                            Ok(_) => report.partitions_synced += 1,
                            Err(e) => tracing::error!(collection, partition, error = %e, "resync write failed"),
                        }
                    }
                    Ok(_) => match self.state.remove(collection, partition).await {
                        Ok(true) => report.stale_records_removed += 1,
                        Ok(false) => {}
                        Err(e) => tracing::error!(collection, partition, error = %e, "resync delete failed"),
                    },
                    Err(e) => {
                        tracing::error!(collection, partition, error = %e, "load state query failed")
                    }
                }
            }

            for record in self.state.list_collection(collection).await? {
                if !partitions.contains(&record.partition)
                    && self.state.remove(collection, &record.partition).await?
                {
                    report.stale_records_removed += 1;
                }
            }
        }

        for record in self.state.list().await? {
            if !collections.contains(&record.collection)
                && self
                    .state
                    .remove(&record.collection, &record.partition)
                    .await?
            {
                report.stale_records_removed += 1;
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            collections = report.collections_checked,
            partitions = report.partitions_checked,
            synced = report.partitions_synced,
            stale_removed = report.stale_records_removed,
            elapsed_ms = report.elapsed_ms,
            "partition state resynchronized"
        );
        Ok(report)
    }

    /// Load every tracked partition the vector store is not holding.
    pub async fn reload_tracked(&self) -> Result<ReloadReport> {
        let mut report = ReloadReport::default();
        let mut by_collection: BTreeMap<String, Vec<PartitionRecord>> = BTreeMap::new();
        for record in self.state.list().await? {
            by_collection
                .entry(record.collection.clone())
                .or_default()
                .push(record);
        }

        for (collection, records) in by_collection {
            match self.vectors.get_load_state(&collection, None).await {
                Ok(LoadState::NotExist) => {
                    for record in records {
                        self.state.remove(&collection, &record.partition).await?;
                        report.dropped.push(record.key());
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    for record in records {
                        report.failed.push((record.key(), e.to_string()));
                    }
                    continue;
                }
            }

            for record in records {
                let key = record.key();
                let lock = self.lock_for(&collection, &record.partition);
                let _guard = lock.lock().await;
                match self
                    .vectors
                    .get_load_state(&collection, Some(&record.partition))
                    .await
                {
                    Ok(LoadState::Loaded) => report.already_loaded += 1,
                    Ok(LoadState::NotExist) => {
                        self.state.remove(&collection, &record.partition).await?;
                        report.dropped.push(key);
                    }
                    Ok(_) => match self.vectors.load_partition(&collection, &record.partition).await {
                        Ok(()) => {
                            self.state.touch(&collection, &record.partition).await?;
                            report.reloaded.push(key);
                        }
                        Err(e) => report.failed.push((key, e.to_string())),
                    },
                    Err(e) => report.failed.push((key, e.to_string())),
                }
            }
        }

        tracing::info!(
            reloaded = report.reloaded.len(),
            already_loaded = report.already_loaded,
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            "tracked partitions reloaded"
        );
        Ok(report)
    }

    pub async fn status(&self) -> Result<PartitionStatus> {
        let records = self.state.list().await?;
        Ok(PartitionStatus::from_records(
            records,
            self.state.clock().now(),
            &self.settings,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragsync_core::clock::ManualClock;
    use ragsync_core::kv::memory::InMemoryKvStore;
    use ragsync_core::vector::memory::InMemoryVectorStore;

    struct NoPressure;

    impl MemoryProbe for NoPressure {
        fn utilization_percent(&self) -> f64 {
            10.0
        }
    }

    async fn cache() -> (Arc<ManualClock>, Arc<InMemoryVectorStore>, PartitionCache) {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let vectors = Arc::new(InMemoryVectorStore::new());
        vectors.create_collection("c", 2).await.unwrap();
        vectors.create_partition("c", "p1").await.unwrap();
        vectors.create_partition("c", "p2").await.unwrap();
        let state =
            PartitionStateStore::new(kv, clock.clone(), "t", Duration::from_secs(24 * 3600));
        let cache = PartitionCache::new(
            vectors.clone(),
            state,
            Arc::new(NoPressure),
            CacheSettings::default(),
        );
        (clock, vectors, cache)
    }

    #[tokio::test]
    async fn test_ensure_loaded_loads_and_tracks() {
        let (_clock, vectors, cache) = cache().await;
        assert!(cache.ensure_loaded("c", "p1", false).await);
        assert!(vectors.is_loaded("c", "p1"));
        assert!(!vectors.is_loaded("c", "p2"));
        assert!(cache.is_tracked("c", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_collection_returns_false() {
        let (_clock, _vectors, cache) = cache().await;
        assert!(!cache.ensure_loaded("nope", "p1", false).await);
        assert!(!cache.is_tracked("nope", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_partition_returns_false() {
        let (_clock, _vectors, cache) = cache().await;
        assert!(!cache.ensure_loaded("c", "p9", false).await);
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let (_clock, vectors, cache) = cache().await;
        cache.ensure_loaded("c", "p1", false).await;
        assert!(cache.evict("c", "p1").await.unwrap());
        assert!(!vectors.is_loaded("c", "p1"));
        assert!(!cache.evict("c", "p1").await.unwrap());
        // A dropped partition is also fine.
        vectors.drop_partition("c", "p2").await.unwrap();
        assert!(!cache.evict("c", "p2").await.unwrap());
    }

    #[tokio::test]
    async fn test_fast_path_after_external_release_still_reports_true() {
        // Tracked state is a belief: the fast path trusts it.
        let (_clock, vectors, cache) = cache().await;
        cache.ensure_loaded("c", "p1", false).await;
        vectors.release_partition("c", "p1").await.unwrap();
        assert!(cache.ensure_loaded("c", "p1", false).await);
        assert!(!vectors.is_loaded("c", "p1"));
        // A forced reload goes to the store.
        assert!(cache.ensure_loaded("c", "p1", true).await);
        assert!(vectors.is_loaded("c", "p1"));
    }

    #[tokio::test]
    async fn test_status_reports_oldest() {
        let (clock, _vectors, cache) = cache().await;
        cache.ensure_loaded("c", "p1", false).await;
        clock.advance(chrono::Duration::minutes(7));
        cache.ensure_loaded("c", "p2", false).await;

        let status = cache.status().await.unwrap();
        assert_eq!(status.total_loaded, 2);
        assert_eq!(status.collections, vec!["c"]);
        let oldest = status.oldest.unwrap();
        assert_eq!(oldest.key, PartitionKey::new("c", "p1"));
        assert_eq!(oldest.minutes_idle, 7);
        assert_eq!(status.ttl_minutes, 30);
    }

    #[tokio::test]
    async fn test_forget_leaves_vector_store_alone() {
        let (_clock, vectors, cache) = cache().await;
        cache.ensure_loaded("c", "p1", false).await;
        assert!(cache.forget("c", "p1").await.unwrap());
        assert!(vectors.is_loaded("c", "p1"));
        assert!(!cache.is_tracked("c", "p1").await.unwrap());
    }
}
