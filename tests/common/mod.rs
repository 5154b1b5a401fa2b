//! Shared fakes for the integration tests.
//!
//! Each test binary compiles this module separately and uses a different
//! subset of it.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use ragsync::config::Config;
use ragsync::memory::MemoryProbe;
use ragsync::service::{RagService, ServiceParts};
use ragsync::sqlite_kv::SqliteKvStore;
use ragsync::sqlite_store::SqliteDocumentStore;
use ragsync::{db, migrate};
use ragsync_core::clock::ManualClock;
use ragsync_core::embedding::EmbeddingClient;
use ragsync_core::models::{
    BotStats, DeletedRows, LoadState, NewDocument, StoredDocument,
};
use ragsync_core::store::DocumentStore;
use ragsync_core::vector::memory::InMemoryVectorStore;
use ragsync_core::vector::{VectorFilter, VectorHit, VectorRow, VectorStore};
use ragsync_core::{Result, SyncError};

pub const ACCOUNT: &str = "acme";
pub const BOT: &str = "bot-1";
pub const COLLECTION: &str = "collection_acme";
pub const PARTITION: &str = "bot_bot1";
pub const DIMS: usize = 4;

/// Ordered record of store calls, shared between fakes.
#[derive(Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<String>>>);

impl OpLog {
    pub fn push(&self, op: impl Into<String>) {
        self.0.lock().unwrap().push(op.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, op: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == op)
    }
}

/// In-memory vector store with call counting, injectable delay, and
/// injectable failures.
pub struct InstrumentedVectorStore {
    inner: InMemoryVectorStore,
    pub log: OpLog,
    load_calls: AtomicUsize,
    load_delay: Mutex<Duration>,
    fail_loads: AtomicBool,
    fail_inserts: Mutex<Option<SyncError>>,
    fail_flushes: AtomicBool,
    hang_flushes: AtomicBool,
    releases: Mutex<Vec<String>>,
    flushes: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl InstrumentedVectorStore {
    pub fn new(log: OpLog) -> Self {
        Self {
            inner: InMemoryVectorStore::new(),
            log,
            load_calls: AtomicUsize::new(0),
            load_delay: Mutex::new(Duration::ZERO),
            fail_loads: AtomicBool::new(false),
            fail_inserts: Mutex::new(None),
            fail_flushes: AtomicBool::new(false),
            hang_flushes: AtomicBool::new(false),
            releases: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &InMemoryVectorStore {
        &self.inner
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inserts_with(&self, err: Option<SyncError>) {
        *self.fail_inserts.lock().unwrap() = err;
    }

    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Never complete any flush.
    pub fn hang_flushes(&self, hang: bool) {
        self.hang_flushes.store(hang, Ordering::SeqCst);
    }

    /// Partitions released, in call order.
    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().unwrap().clone()
    }

    pub fn flushes(&self, collection: &str) -> Vec<tokio::time::Instant> {
        self.flushes
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl VectorStore for InstrumentedVectorStore {
    async fn create_collection(&self, collection: &str, dimension: usize) -> Result<bool> {
        self.inner.create_collection(collection, dimension).await
    }

    async fn create_partition(&self, collection: &str, partition: &str) -> Result<bool> {
        self.inner.create_partition(collection, partition).await
    }

    async fn drop_partition(&self, collection: &str, partition: &str) -> Result<u64> {
        self.log.push("vector.drop_partition");
        self.inner.drop_partition(collection, partition).await
    }

    async fn count_rows(&self, collection: &str, partition: &str) -> Result<u64> {
        self.inner.count_rows(collection, partition).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.inner.list_collections().await
    }

    async fn list_partitions(&self, collection: &str) -> Result<Vec<String>> {
        self.inner.list_partitions(collection).await
    }

    async fn load_partition(&self, collection: &str, partition: &str) -> Result<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(SyncError::transient("vector", "load refused"));
        }
        self.inner.load_partition(collection, partition).await
    }

    async fn release_partition(&self, collection: &str, partition: &str) -> Result<()> {
        self.releases.lock().unwrap().push(partition.to_string());
        self.inner.release_partition(collection, partition).await
    }

    async fn get_load_state(
        &self,
        collection: &str,
        partition: Option<&str>,
    ) -> Result<LoadState> {
        self.inner.get_load_state(collection, partition).await
    }

    async fn insert_vectors(
        &self,
        collection: &str,
        partition: &str,
        rows: Vec<VectorRow>,
    ) -> Result<usize> {
        self.log.push("vector.insert");
        if let Some(err) = self.fail_inserts.lock().unwrap().clone() {
            return Err(err);
        }
        self.inner.insert_vectors(collection, partition, rows).await
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        partition: &str,
        filter: &VectorFilter,
    ) -> Result<u64> {
        self.log.push("vector.delete");
        self.inner.delete_by_filter(collection, partition, filter).await
    }

    async fn flush(&self, collection: &str) -> Result<()> {
        if self.hang_flushes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(SyncError::transient("vector", "flush refused"));
        }
        self.flushes
            .lock()
            .unwrap()
            .push((collection.to_string(), tokio::time::Instant::now()));
        self.inner.flush(collection).await
    }

    async fn search(
        &self,
        collection: &str,
        partitions: &[String],
        query: &[f32],
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>> {
        self.inner
            .search(collection, partitions, query, limit, filter)
            .await
    }
}

/// Deterministic embedder with scripted failures.
pub struct ScriptedEmbedder {
    dims: usize,
    calls: AtomicUsize,
    /// Texts containing this marker fail with a terminal error.
    poison: Mutex<Option<String>>,
    transient_failures: AtomicUsize,
    hang: AtomicBool,
}

impl ScriptedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
            poison: Mutex::new(None),
            transient_failures: AtomicUsize::new(0),
            hang: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn poison(&self, marker: &str) {
        *self.poison.lock().unwrap() = Some(marker.to_string());
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Never complete any call.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.1f32; self.dims];
        for (i, b) in text.bytes().enumerate() {
            v[i % self.dims] += b as f32 / 255.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedEmbedder {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::transient("embedding", "503 from scripted embedder"));
        }
        if let Some(marker) = self.poison.lock().unwrap().as_deref() {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(SyncError::terminal("embedding", "400 from scripted embedder"));
            }
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// SQLite document store whose bulk deletes can be made to fail.
pub struct FailingDocumentStore {
    inner: SqliteDocumentStore,
    log: OpLog,
    fail_deletes: AtomicBool,
    blind_lookups: AtomicBool,
}

impl FailingDocumentStore {
    pub fn new(inner: SqliteDocumentStore, log: OpLog) -> Self {
        Self {
            inner,
            log,
            fail_deletes: AtomicBool::new(false),
            blind_lookups: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &SqliteDocumentStore {
        &self.inner
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Report no existing content names, as if every lookup raced a
    /// concurrent insert.
    pub fn blind_lookups(&self, blind: bool) {
        self.blind_lookups.store(blind, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn existing_content_names(
        &self,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<HashSet<String>> {
        if self.blind_lookups.load(Ordering::SeqCst) {
            return Ok(HashSet::new());
        }
        self.inner.existing_content_names(bot_id, content_names).await
    }

    async fn insert_document(&self, doc: &NewDocument) -> Result<i64> {
        self.log.push("relational.insert");
        self.inner.insert_document(doc).await
    }

    async fn delete_document(&self, document_id: i64) -> Result<bool> {
        self.log.push("relational.delete_document");
        self.inner.delete_document(document_id).await
    }

    async fn get_document(
        &self,
        bot_id: &str,
        content_name: &str,
    ) -> Result<Option<StoredDocument>> {
        self.inner.get_document(bot_id, content_name).await
    }

    async fn documents_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredDocument>> {
        self.inner.documents_by_ids(ids).await
    }

    async fn delete_by_content_names(
        &self,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<DeletedRows> {
        self.log.push("relational.delete");
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SyncError::terminal("relational", "disk I/O error"));
        }
        self.inner.delete_by_content_names(bot_id, content_names).await
    }

    async fn delete_bot_data(&self, bot_id: &str) -> Result<DeletedRows> {
        self.log.push("relational.delete_bot");
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SyncError::terminal("relational", "disk I/O error"));
        }
        self.inner.delete_bot_data(bot_id).await
    }

    async fn register_bot(&self, account_id: &str, bot_id: &str, bot_name: &str) -> Result<bool> {
        self.inner.register_bot(account_id, bot_id, bot_name).await
    }

    async fn bot_stats(&self, bot_id: &str) -> Result<BotStats> {
        self.inner.bot_stats(bot_id).await
    }
}

/// Memory utilization that rises with the number of loaded partitions.
pub struct LoadDrivenMemoryProbe {
    vectors: Arc<InstrumentedVectorStore>,
    base_percent: f64,
    per_partition_percent: f64,
}

impl LoadDrivenMemoryProbe {
    pub fn new(vectors: Arc<InstrumentedVectorStore>, base: f64, per_partition: f64) -> Self {
        Self {
            vectors,
            base_percent: base,
            per_partition_percent: per_partition,
        }
    }
}

impl MemoryProbe for LoadDrivenMemoryProbe {
    fn utilization_percent(&self) -> f64 {
        self.base_percent
            + self.per_partition_percent * self.vectors.inner().loaded_partition_count() as f64
    }
}

/// A fully wired service over SQLite in a temp dir, the instrumented vector
/// store, and the scripted embedder.
pub struct TestEnv {
    pub tmp: TempDir,
    pub config: Config,
    pub log: OpLog,
    pub vectors: Arc<InstrumentedVectorStore>,
    pub documents: Arc<FailingDocumentStore>,
    pub embedder: Arc<ScriptedEmbedder>,
    pub clock: Arc<ManualClock>,
    pub kv: Arc<SqliteKvStore>,
    pub service: RagService,
}

pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("data").join("ragsync.sqlite"));
    config.embedding.dims = DIMS;
    config.embedding.max_batch_size = 2;
    config.retry.max_retries = 2;
    config.retry.backoff_seconds = 0.01;
    config.metadata.vector_fields = vec!["content_type".to_string()];
    config
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(adjust, |vectors| {
            Arc::new(LoadDrivenMemoryProbe::new(vectors, 10.0, 0.0))
        })
        .await
    }

    pub async fn build(
        adjust: impl FnOnce(&mut Config),
        memory: impl FnOnce(Arc<InstrumentedVectorStore>) -> Arc<dyn MemoryProbe>,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        adjust(&mut config);

        let pool = db::connect(&config).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();

        let log = OpLog::default();
        let vectors = Arc::new(InstrumentedVectorStore::new(log.clone()));
        vectors.create_collection(COLLECTION, DIMS).await.unwrap();
        vectors.create_partition(COLLECTION, PARTITION).await.unwrap();

        let documents = Arc::new(FailingDocumentStore::new(
            SqliteDocumentStore::new(pool.clone()),
            log.clone(),
        ));
        let embedder = Arc::new(ScriptedEmbedder::new(DIMS));
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(SqliteKvStore::with_clock(pool, clock.clone()));

        let service = RagService::new(
            &config,
            ServiceParts {
                documents: documents.clone(),
                vectors: vectors.clone(),
                kv: kv.clone(),
                embedder: embedder.clone(),
                memory: memory(vectors.clone()),
                clock: clock.clone(),
            },
        );

        Self {
            tmp,
            config,
            log,
            vectors,
            documents,
            embedder,
            clock,
            kv,
            service,
        }
    }
}

pub fn chunks(texts: &[&str]) -> Vec<ragsync_core::models::ChunkInput> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| ragsync_core::models::ChunkInput {
            index: i as i64,
            text: t.to_string(),
        })
        .collect()
}

pub fn metadata(value: serde_json::Value) -> ragsync_core::metadata::Metadata {
    value.as_object().cloned().unwrap_or_default()
}
