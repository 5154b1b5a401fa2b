//! Service wiring and lifecycle.
//!
//! [`RagService`] owns one instance of every component and shares them by
//! `Arc`. Nothing runs until [`RagService::start`]:
//!
//! 1. Reconcile tracked partitions with the vector store: optionally reload
//!    what the records say was loaded, then resync the records from the
//!    store's live state.
//! 2. Spawn the eviction loop and the flush loop.
//!
//! [`RagService::stop`] signals both loops, waits for them up to the
//! shutdown timeout, then flushes whatever is still dirty within a second
//! shutdown timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinHandle;

use ragsync_core::clock::{Clock, SystemClock};
use ragsync_core::embedding::EmbeddingClient;
use ragsync_core::kv::KeyValueStore;
use ragsync_core::store::DocumentStore;
use ragsync_core::vector::VectorStore;
use ragsync_core::{Result, SyncError};

use crate::config::Config;
use crate::embedding::create_client;
use crate::flush::{DrainReport, FlushBatcher, FlushSettings};
use crate::memory::{MemoryProbe, SystemMemoryProbe};
use crate::partition_cache::{CacheSettings, PartitionCache, ReloadReport, ResyncReport};
use crate::partition_state::PartitionStateStore;
use crate::provision::Provisioner;
use crate::retry::RetryPolicy;
use crate::saga::{SagaCoordinator, SagaSettings};
use crate::search::SearchService;
use crate::shutdown::{self, ShutdownTrigger};
use crate::sqlite_kv::SqliteKvStore;
use crate::sqlite_store::SqliteDocumentStore;
use crate::{db, migrate};

/// External collaborators the service is built over.
pub struct ServiceParts {
    pub documents: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub memory: Arc<dyn MemoryProbe>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub resync: Option<ResyncReport>,
    pub reload: Option<ReloadReport>,
}

struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct RagService {
    cache: Arc<PartitionCache>,
    flusher: Arc<FlushBatcher>,
    saga: SagaCoordinator,
    search: SearchService,
    provisioner: Provisioner,
    resync_on_start: bool,
    reload_on_start: bool,
    shutdown_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl RagService {
    pub fn new(config: &Config, parts: ServiceParts) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let state = PartitionStateStore::new(
            parts.kv,
            parts.clock,
            config.partitions.key_prefix.clone(),
            config.partitions.record_ttl(),
        );
        let cache = Arc::new(PartitionCache::new(
            parts.vectors.clone(),
            state,
            parts.memory,
            CacheSettings::from_config(&config.partitions),
        ));
        let flusher = Arc::new(FlushBatcher::new(
            parts.vectors.clone(),
            FlushSettings::from_config(&config.flush),
        ));
        let saga = SagaCoordinator::new(
            parts.documents.clone(),
            parts.vectors.clone(),
            parts.embedder.clone(),
            cache.clone(),
            flusher.clone(),
            config.naming(),
            config.allow_list(),
            SagaSettings::from_config(config),
        );
        let search = SearchService::new(
            parts.documents.clone(),
            parts.vectors.clone(),
            parts.embedder,
            cache.clone(),
            config.naming(),
            config.allow_list(),
            retry,
        );
        let provisioner = Provisioner::new(
            parts.documents,
            parts.vectors,
            cache.clone(),
            config.naming(),
            config.embedding.dims,
            retry,
        );

        Self {
            cache,
            flusher,
            saga,
            search,
            provisioner,
            resync_on_start: config.partitions.resync_on_start,
            reload_on_start: config.partitions.reload_on_start,
            shutdown_timeout: config.shutdown_timeout(),
            running: Mutex::new(None),
        }
    }

    /// Build a service over the SQLite relational and key-value stores
    /// named in `config`, the configured embedding provider, and the given
    /// vector store.
    pub async fn connect(config: &Config, vectors: Arc<dyn VectorStore>) -> anyhow::Result<Self> {
        migrate::run_migrations(config).await?;
        let pool = db::connect(config).await?;
        let embedder = create_client(&config.embedding).context("creating embedding client")?;
        let parts = ServiceParts {
            documents: Arc::new(SqliteDocumentStore::new(pool.clone())),
            vectors,
            kv: Arc::new(SqliteKvStore::new(pool)),
            embedder,
            memory: Arc::new(SystemMemoryProbe::new()),
            clock: Arc::new(SystemClock),
        };
        Ok(Self::new(config, parts))
    }

    pub fn cache(&self) -> &Arc<PartitionCache> {
        &self.cache
    }

    pub fn flusher(&self) -> &Arc<FlushBatcher> {
        &self.flusher
    }

    pub fn saga(&self) -> &SagaCoordinator {
        &self.saga
    }

    pub fn search(&self) -> &SearchService {
        &self.search
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Reconcile partition state and spawn the background loops.
    ///
    /// Reconciliation failures are logged and do not prevent startup.
    pub async fn start(&self) -> Result<StartupReport> {
        if self.is_running() {
            return Err(SyncError::InvalidInput("service already started".to_string()));
        }

        // Reload first: resync drops every record whose partition is not
        // loaded, which is exactly what reload needs to see.
        let mut report = StartupReport::default();
        if self.reload_on_start {
            match self.cache.reload_tracked().await {
                Ok(reload) => report.reload = Some(reload),
                Err(e) => tracing::error!(error = %e, "startup reload failed"),
            }
        }
        if self.resync_on_start {
            match self.cache.resync().await {
                Ok(resync) => report.resync = Some(resync),
                Err(e) => tracing::error!(error = %e, "startup resync failed"),
            }
        }

        let (trigger, signal) = shutdown::channel();
        let tasks = vec![
            (
                "eviction",
                tokio::spawn(self.cache.clone().run_eviction_loop(signal.clone())),
            ),
            ("flush", tokio::spawn(self.flusher.clone().run(signal))),
        ];

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            trigger.trigger();
            return Err(SyncError::InvalidInput("service already started".to_string()));
        }
        *running = Some(Running { trigger, tasks });
        tracing::info!("service started");
        Ok(report)
    }

    /// Stop the background loops and drain pending flushes.
    ///
    /// A loop that does not exit within the shutdown timeout is aborted.
    /// The final drain gets its own shutdown timeout; collections it could
    /// not flush in time are reported as failed and stay marked. Calling
    /// this on a stopped service only drains.
    pub async fn stop(&self) -> DrainReport {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Running { trigger, tasks }) = running {
            trigger.trigger();
            let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
            for (name, mut handle) in tasks {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(Ok(())) => tracing::debug!(task = name, "background task joined"),
                    Ok(Err(e)) => tracing::error!(task = name, error = %e, "background task failed"),
                    Err(_) => {
                        tracing::warn!(task = name, "background task did not stop in time, aborting");
                        handle.abort();
                    }
                }
            }
        }

        let drain_deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let report = self.flusher.drain_until(drain_deadline).await;
        tracing::info!(
            flushed = report.flushed.len(),
            failed = report.failed.len(),
            "service stopped"
        );
        report
    }
}
