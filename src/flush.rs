//! Debounced per-collection flushing.
//!
//! Writers call [`FlushBatcher::mark_dirty`] after every vector mutation.
//! A background loop polls the dirty map and flushes a collection once it
//! has been quiet for the debounce delay, or once its oldest unflushed
//! change is older than the max wait, whichever comes first. A burst of
//! writes therefore costs one flush, and a steady stream of writes still
//! becomes searchable within the ceiling.
//!
//! Marks are only cleared after a flush succeeds, and a mark that changed
//! while its flush was in flight survives the flush. Cancelling a flush
//! mid-call loses nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use ragsync_core::vector::VectorStore;
use ragsync_core::Result;

use crate::config::FlushConfig;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushSettings {
    pub delay: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl FlushSettings {
    pub fn from_config(config: &FlushConfig) -> Self {
        Self {
            delay: Duration::from_secs_f64(config.delay_seconds),
            max_wait: Duration::from_secs_f64(config.max_wait_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self::from_config(&FlushConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct DirtyMark {
    last_change_at: Instant,
    /// First change not yet covered by a successful flush.
    window_start: Instant,
}

#[derive(Default)]
struct FlushState {
    dirty: HashMap<String, DirtyMark>,
    last_flush: HashMap<String, Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlushStatus {
    pub running: bool,
    pub delay_seconds: f64,
    pub max_wait_seconds: f64,
    pub pending_count: usize,
    pub pending_collections: Vec<String>,
    /// Seconds since each collection's last successful flush.
    pub seconds_since_flush: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub flushed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct FlushBatcher {
    vectors: Arc<dyn VectorStore>,
    settings: FlushSettings,
    state: Mutex<FlushState>,
    running: AtomicBool,
}

impl FlushBatcher {
    pub fn new(vectors: Arc<dyn VectorStore>, settings: FlushSettings) -> Self {
        Self {
            vectors,
            settings,
            state: Mutex::new(FlushState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &FlushSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, FlushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a change to `collection`.
    pub fn mark_dirty(&self, collection: &str) {
        let now = Instant::now();
        let mut state = self.state();
        state
            .dirty
            .entry(collection.to_string())
            .and_modify(|mark| mark.last_change_at = now)
            .or_insert(DirtyMark {
                last_change_at: now,
                window_start: now,
            });
    }

    pub fn is_dirty(&self, collection: &str) -> bool {
        self.state().dirty.contains_key(collection)
    }

    pub fn pending(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().dirty.keys().cloned().collect();
        names.sort();
        names
    }

    /// Collections whose quiet period or ceiling has elapsed at `now`.
    pub fn due_at(&self, now: Instant) -> Vec<String> {
        let state = self.state();
        let mut due: Vec<String> = state
            .dirty
            .iter()
            .filter(|(_, mark)| {
                now.saturating_duration_since(mark.last_change_at) >= self.settings.delay
                    || now.saturating_duration_since(mark.window_start) >= self.settings.max_wait
            })
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();
        due
    }

    async fn flush_collection(&self, collection: &str) -> Result<()> {
        let started = Instant::now();
        self.vectors.flush(collection).await?;

        let mut state = self.state();
        match state.dirty.get_mut(collection) {
            Some(mark) if mark.last_change_at > started => {
                mark.window_start = started;
            }
            _ => {
                state.dirty.remove(collection);
            }
        }
        state.last_flush.insert(collection.to_string(), Instant::now());
        drop(state);

        tracing::debug!(
            collection,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collection flushed"
        );
        Ok(())
    }

    /// Flush `collection` now, whether or not it is marked.
    pub async fn immediate_flush(&self, collection: &str) -> Result<()> {
        self.flush_collection(collection).await
    }

    /// Flush every due collection once. Returns how many flushed.
    pub async fn poll_once(&self) -> usize {
        let mut flushed = 0;
        for collection in self.due_at(Instant::now()) {
            match self.flush_collection(&collection).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "flush failed, mark kept")
                }
            }
        }
        flushed
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        self.running.store(true, Ordering::SeqCst);
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            delay_ms = self.settings.delay.as_millis() as u64,
            max_wait_ms = self.settings.max_wait.as_millis() as u64,
            "flush loop started"
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
                _ = self.poll_once() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(pending = self.state().dirty.len(), "flush loop stopped");
    }

    /// Flush everything still marked, ignoring debounce. Failures are
    /// reported, not returned.
    pub async fn drain(&self) -> DrainReport {
        self.drain_inner(None).await
    }

    /// Like [`drain`](Self::drain), but gives up at `deadline`. Collections
    /// not flushed by then are reported as failed and stay marked.
    pub async fn drain_until(&self, deadline: Instant) -> DrainReport {
        self.drain_inner(Some(deadline)).await
    }

    async fn drain_inner(&self, deadline: Option<Instant>) -> DrainReport {
        let mut report = DrainReport::default();
        for collection in self.pending() {
            let flushed = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.flush_collection(&collection))
                        .await
                    {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err("shutdown timeout elapsed before flush".to_string()),
                    }
                }
                None => self
                    .flush_collection(&collection)
                    .await
                    .map_err(|e| e.to_string()),
            };
            match flushed {
                Ok(()) => report.flushed.push(collection),
                Err(e) => {
                    tracing::error!(collection = %collection, error = %e, "final flush failed");
                    report.failed.push((collection, e));
                }
            }
        }
        if !report.flushed.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                flushed = report.flushed.len(),
                failed = report.failed.len(),
                "pending flushes drained"
            );
        }
        report
    }

    /// When `collection` was last flushed successfully.
    pub fn last_flush_time(&self, collection: &str) -> Option<Instant> {
        self.state().last_flush.get(collection).copied()
    }

    pub fn status(&self) -> FlushStatus {
        let now = Instant::now();
        let state = self.state();
        let mut pending_collections: Vec<String> = state.dirty.keys().cloned().collect();
        pending_collections.sort();
        FlushStatus {
            running: self.running.load(Ordering::SeqCst),
            delay_seconds: self.settings.delay.as_secs_f64(),
            max_wait_seconds: self.settings.max_wait.as_secs_f64(),
            pending_count: pending_collections.len(),
            pending_collections,
            seconds_since_flush: state
                .last_flush
                .iter()
                .map(|(name, at)| (name.clone(), now.saturating_duration_since(*at).as_secs_f64()))
                .collect(),
        }
    }
}
