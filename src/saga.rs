//! Multi-store writes with compensation.
//!
//! A document lives in two stores that share no transaction: the relational
//! store owns its existence and the vector store owns its embeddings. The
//! coordinator orders every write so a failure can be undone:
//!
//! ```text
//! insert:  relational tx ─▶ embed ─▶ ensure loaded ─▶ vectors ─▶ mark dirty
//!                 ▲            │             │             │
//!                 └──── compensate: delete vectors, delete row ◀┘
//!
//! delete:  vectors ─▶ relational rows ─▶ mark dirty
//!                           │
//!                           └─ failure here ─▶ ConsistencyWarning
//! ```
//!
//! Once the relational row is committed, every exit path other than success
//! removes it again, including the caller dropping the future or the
//! request timeout elapsing. Compensation errors are logged and never
//! replace the error that caused them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use ragsync_core::embedding::EmbeddingClient;
use ragsync_core::metadata::{Metadata, MetadataAllowList};
use ragsync_core::models::{ChunkInput, NewDocument};
use ragsync_core::naming::Naming;
use ragsync_core::store::DocumentStore;
use ragsync_core::vector::{VectorFilter, VectorRow, VectorStore};
use ragsync_core::{ErrorKind, Result, SyncError};

use crate::config::Config;
use crate::embedding::embed_in_batches;
use crate::flush::FlushBatcher;
use crate::partition_cache::PartitionCache;
use crate::retry::{RetryPolicy, RetryableOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl OperationStatus {
    fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Self::Success,
            (0, _) => Self::Failed,
            _ => Self::PartialSuccess,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Success,
    Skipped,
    Failed,
}

/// Wall time per phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTimings {
    pub relational_ms: u64,
    pub embedding_ms: u64,
    pub vector_ms: u64,
    pub total_ms: u64,
}

impl PhaseTimings {
    fn absorb(&mut self, other: &PhaseTimings) {
        self.relational_ms += other.relational_ms;
        self.embedding_ms += other.embedding_ms;
        self.vector_ms += other.vector_ms;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// One document of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub content_name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub chunks: Vec<ChunkInput>,
}

/// A document with precomputed embeddings, one per chunk in chunk order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedDocument {
    #[serde(flatten)]
    pub document: DocumentInput,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertStatus {
    Inserted,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsertOutcome {
    pub content_name: String,
    pub status: InsertStatus,
    pub document_id: Option<i64>,
    pub chunk_count: usize,
    pub timings: PhaseTimings,
}

impl InsertOutcome {
    fn skipped(content_name: &str, timings: PhaseTimings) -> Self {
        Self {
            content_name: content_name.to_string(),
            status: InsertStatus::Skipped,
            document_id: None,
            chunk_count: 0,
            timings,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub content_name: String,
    pub status: DocumentStatus,
    pub document_id: Option<i64>,
    pub reason: Option<String>,
}

impl DocumentResult {
    fn skipped(content_name: &str, reason: &str) -> Self {
        Self {
            content_name: content_name.to_string(),
            status: DocumentStatus::Skipped,
            document_id: None,
            reason: Some(reason.to_string()),
        }
    }

    fn failed(content_name: &str, reason: impl Into<String>) -> Self {
        Self {
            content_name: content_name.to_string(),
            status: DocumentStatus::Failed,
            document_id: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: OperationStatus,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<DocumentResult>,
    pub timings: PhaseTimings,
}

/// Vectors and relational rows disagree after a partially failed delete.
///
/// Not an error: the operation already happened. Logged on the
/// `ragsync::consistency` target when created.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyWarning {
    pub operation: &'static str,
    pub bot_id: String,
    pub content_names: Vec<String>,
    pub vectors_removed: u64,
    pub error: String,
}

impl ConsistencyWarning {
    fn raise(
        operation: &'static str,
        bot_id: &str,
        content_names: Vec<String>,
        vectors_removed: u64,
        error: &SyncError,
    ) -> Self {
        tracing::error!(
            target: "ragsync::consistency",
            operation,
            bot_id,
            content_names = ?content_names,
            vectors_removed,
            error = %error,
            "vectors removed but relational delete failed; rows now have no vectors"
        );
        Self {
            operation,
            bot_id: bot_id.to_string(),
            content_names,
            vectors_removed,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub status: OperationStatus,
    pub requested: usize,
    pub documents_deleted: u64,
    pub chunks_deleted: u64,
    pub vectors_deleted: u64,
    pub results: Vec<DocumentResult>,
    pub consistency_warning: Option<ConsistencyWarning>,
    pub timings: PhaseTimings,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotDeleteReport {
    pub status: OperationStatus,
    pub vectors_deleted: u64,
    /// `false` when rows of another bot id still live in the partition.
    pub partition_dropped: bool,
    pub documents_deleted: u64,
    pub chunks_deleted: u64,
    pub consistency_warning: Option<ConsistencyWarning>,
    pub timings: PhaseTimings,
}

#[derive(Debug, Clone)]
pub struct SagaSettings {
    pub retry: RetryPolicy,
    pub max_batch_size: usize,
    pub dimensions: usize,
    /// Upper bound on everything after the relational commit.
    pub request_timeout: Option<Duration>,
}

impl SagaSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.retry),
            max_batch_size: config.embedding.max_batch_size,
            dimensions: config.embedding.dims,
            request_timeout: config.request_timeout(),
        }
    }
}

/// Undo for a committed document row.
struct CompensationPlan {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    collection: String,
    partition: String,
    bot_id: String,
    document_id: i64,
    vector_phase_started: bool,
}

impl CompensationPlan {
    async fn run(self) {
        if self.vector_phase_started {
            let filter = VectorFilter::for_bot(&self.bot_id).with_document_ids(vec![self.document_id]);
            match self
                .vectors
                .delete_by_filter(&self.collection, &self.partition, &filter)
                .await
            {
                Ok(removed) => tracing::debug!(
                    document_id = self.document_id,
                    removed,
                    "compensation removed vectors"
                ),
                Err(e) => tracing::warn!(
                    document_id = self.document_id,
                    error = %e,
                    "compensation could not remove vectors"
                ),
            }
        }

        match self.documents.delete_document(self.document_id).await {
            Ok(true) => tracing::info!(
                document_id = self.document_id,
                bot_id = %self.bot_id,
                "compensation removed document row"
            ),
            Ok(false) => tracing::warn!(
                document_id = self.document_id,
                "compensation found document row already gone"
            ),
            Err(e) => tracing::error!(
                document_id = self.document_id,
                bot_id = %self.bot_id,
                error = %e,
                "compensation failed, document row left behind"
            ),
        }
    }
}

/// Runs the plan on drop unless disarmed.
struct CompensationGuard {
    plan: Option<CompensationPlan>,
}

impl CompensationGuard {
    fn vector_phase_started(&mut self) {
        if let Some(plan) = self.plan.as_mut() {
            plan.vector_phase_started = true;
        }
    }

    fn disarm(&mut self) -> Option<CompensationPlan> {
        self.plan.take()
    }
}

impl Drop for CompensationGuard {
    fn drop(&mut self) {
        let Some(plan) = self.plan.take() else {
            return;
        };
        tracing::warn!(document_id = plan.document_id, "insert abandoned, compensating");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(plan.run());
            }
            Err(_) => tracing::error!(
                document_id = plan.document_id,
                "no runtime to compensate on, document row left behind"
            ),
        }
    }
}

pub struct SagaCoordinator {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    cache: Arc<PartitionCache>,
    flusher: Arc<FlushBatcher>,
    naming: Naming,
    allow_list: MetadataAllowList,
    settings: SagaSettings,
}

impl SagaCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        cache: Arc<PartitionCache>,
        flusher: Arc<FlushBatcher>,
        naming: Naming,
        allow_list: MetadataAllowList,
        settings: SagaSettings,
    ) -> Self {
        Self {
            documents,
            vectors,
            embedder,
            cache,
            flusher,
            naming,
            allow_list,
            settings,
        }
    }

    fn target(&self, account_id: &str, bot_id: &str) -> Result<(String, String)> {
        Ok((
            self.naming.collection_name(account_id)?,
            self.naming.partition_name(bot_id)?,
        ))
    }

    /// Insert one document. An existing `(bot_id, content_name)` is skipped,
    /// not overwritten.
    pub async fn insert(
        &self,
        account_id: &str,
        bot_id: &str,
        content_name: &str,
        metadata: Metadata,
        chunks: Vec<ChunkInput>,
    ) -> Result<InsertOutcome> {
        let started = Instant::now();
        let (collection, partition) = self.target(account_id, bot_id)?;

        let existing = self
            .documents
            .existing_content_names(bot_id, &[content_name.to_string()])
            .await?;
        if existing.contains(content_name) {
            tracing::info!(bot_id, content_name, "document exists, skipping");
            let timings = PhaseTimings {
                relational_ms: elapsed_ms(started),
                total_ms: elapsed_ms(started),
                ..PhaseTimings::default()
            };
            return Ok(InsertOutcome::skipped(content_name, timings));
        }

        let doc = NewDocument {
            account_id: account_id.to_string(),
            bot_id: bot_id.to_string(),
            content_name: content_name.to_string(),
            metadata,
            chunks,
        };
        self.insert_document(&collection, &partition, doc, None).await
    }

    /// The single-document saga, after naming and the duplicate pre-check.
    async fn insert_document(
        &self,
        collection: &str,
        partition: &str,
        doc: NewDocument,
        embeddings: Option<Vec<Vec<f32>>>,
    ) -> Result<InsertOutcome> {
        let started = Instant::now();
        let mut timings = PhaseTimings::default();

        if doc.chunks.is_empty() {
            return Err(SyncError::InvalidInput(format!(
                "document '{}' has no chunks",
                doc.content_name
            )));
        }

        let relational_started = Instant::now();
        let document_id = match self.documents.insert_document(&doc).await {
            Ok(id) => id,
            Err(e) if e.kind() == ErrorKind::Duplicate => {
                tracing::info!(
                    bot_id = %doc.bot_id,
                    content_name = %doc.content_name,
                    "document inserted concurrently, skipping"
                );
                timings.relational_ms = elapsed_ms(relational_started);
                timings.total_ms = elapsed_ms(started);
                return Ok(InsertOutcome::skipped(&doc.content_name, timings));
            }
            Err(e) => return Err(e),
        };
        timings.relational_ms = elapsed_ms(relational_started);

        let mut guard = CompensationGuard {
            plan: Some(CompensationPlan {
                documents: self.documents.clone(),
                vectors: self.vectors.clone(),
                collection: collection.to_string(),
                partition: partition.to_string(),
                bot_id: doc.bot_id.clone(),
                document_id,
                vector_phase_started: false,
            }),
        };

        let post_commit = self.write_vectors(
            collection,
            partition,
            &doc,
            document_id,
            embeddings,
            &mut guard,
            &mut timings,
        );
        let result = match self.settings.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, post_commit).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::transient(
                    "saga",
                    format!("insert timed out after {:?}", limit),
                )),
            },
            None => post_commit.await,
        };

        match result {
            Ok(()) => {
                guard.disarm();
                self.flusher.mark_dirty(collection);
                timings.total_ms = elapsed_ms(started);
                tracing::info!(
                    document_id,
                    bot_id = %doc.bot_id,
                    content_name = %doc.content_name,
                    chunks = doc.chunks.len(),
                    total_ms = timings.total_ms,
                    "document inserted"
                );
                Ok(InsertOutcome {
                    content_name: doc.content_name,
                    status: InsertStatus::Inserted,
                    document_id: Some(document_id),
                    chunk_count: doc.chunks.len(),
                    timings,
                })
            }
            Err(e) => {
                tracing::error!(
                    document_id,
                    bot_id = %doc.bot_id,
                    content_name = %doc.content_name,
                    error = %e,
                    "insert failed after commit, compensating"
                );
                if let Some(plan) = guard.disarm() {
                    plan.run().await;
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_vectors(
        &self,
        collection: &str,
        partition: &str,
        doc: &NewDocument,
        document_id: i64,
        embeddings: Option<Vec<Vec<f32>>>,
        guard: &mut CompensationGuard,
        timings: &mut PhaseTimings,
    ) -> Result<()> {
        let embeddings = match embeddings {
            Some(vectors) => vectors,
            None => {
                let embedding_started = Instant::now();
                let texts: Vec<String> = doc.chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = embed_in_batches(
                    self.embedder.as_ref(),
                    &texts,
                    self.settings.max_batch_size,
                    self.settings.retry,
                )
                .await;
                timings.embedding_ms = elapsed_ms(embedding_started);
                vectors?
            }
        };

        let vector_started = Instant::now();
        guard.vector_phase_started();
        if !self.cache.ensure_loaded(collection, partition, false).await {
            timings.vector_ms = elapsed_ms(vector_started);
            return Err(SyncError::not_found(
                "partition",
                format!("{}/{}", collection, partition),
            ));
        }

        let vector_metadata = self.allow_list.filter(&doc.metadata);
        let rows: Vec<VectorRow> = doc
            .chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRow {
                document_id,
                bot_id: doc.bot_id.clone(),
                content_name: doc.content_name.clone(),
                chunk_index: chunk.index,
                embedding,
                metadata: vector_metadata.clone(),
            })
            .collect();

        let written = RetryableOperation::new("vector insert", self.settings.retry)
            .run(|| self.vectors.insert_vectors(collection, partition, rows.clone()))
            .await;
        timings.vector_ms = elapsed_ms(vector_started);
        written?;
        Ok(())
    }

    /// Insert many documents for one bot, each as its own saga.
    ///
    /// Names that already exist, or repeat within the batch, are skipped.
    /// One document failing never affects the others.
    pub async fn batch_insert(
        &self,
        account_id: &str,
        bot_id: &str,
        documents: Vec<DocumentInput>,
    ) -> Result<BatchReport> {
        let items = documents.into_iter().map(|d| (d, None)).collect();
        self.run_batch(account_id, bot_id, items).await
    }

    /// Like [`Self::batch_insert`] with caller-supplied embeddings.
    ///
    /// A document whose embeddings do not match its chunks, or the configured
    /// dimension, fails before anything is written.
    pub async fn batch_insert_with_embeddings(
        &self,
        account_id: &str,
        bot_id: &str,
        documents: Vec<EmbeddedDocument>,
    ) -> Result<BatchReport> {
        let items = documents
            .into_iter()
            .map(|d| (d.document, Some(d.embeddings)))
            .collect();
        self.run_batch(account_id, bot_id, items).await
    }

    fn check_embeddings(&self, doc: &DocumentInput, embeddings: &[Vec<f32>]) -> Option<String> {
        if embeddings.len() != doc.chunks.len() {
            return Some(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                doc.chunks.len()
            ));
        }
        embeddings
            .iter()
            .position(|v| v.len() != self.settings.dimensions)
            .map(|i| {
                format!(
                    "embedding {} has dimension {}, expected {}",
                    i,
                    embeddings[i].len(),
                    self.settings.dimensions
                )
            })
    }

    async fn run_batch(
        &self,
        account_id: &str,
        bot_id: &str,
        items: Vec<(DocumentInput, Option<Vec<Vec<f32>>>)>,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let (collection, partition) = self.target(account_id, bot_id)?;
        let mut timings = PhaseTimings::default();

        let names: Vec<String> = items.iter().map(|(d, _)| d.content_name.clone()).collect();
        let precheck_started = Instant::now();
        let existing = self.documents.existing_content_names(bot_id, &names).await?;
        timings.relational_ms += elapsed_ms(precheck_started);

        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut seen: HashSet<String> = HashSet::new();

        for (input, embeddings) in items {
            let name = input.content_name.clone();
            if existing.contains(&name) {
                results.push(DocumentResult::skipped(&name, "already exists"));
                continue;
            }
            if !seen.insert(name.clone()) {
                results.push(DocumentResult::skipped(&name, "repeated in batch"));
                continue;
            }
            if let Some(reason) = embeddings
                .as_deref()
                .and_then(|e| self.check_embeddings(&input, e))
            {
                results.push(DocumentResult::failed(&name, reason));
                continue;
            }

            let doc = NewDocument {
                account_id: account_id.to_string(),
                bot_id: bot_id.to_string(),
                content_name: input.content_name,
                metadata: input.metadata,
                chunks: input.chunks,
            };
            match self
                .insert_document(&collection, &partition, doc, embeddings)
                .await
            {
                Ok(outcome) => {
                    timings.absorb(&outcome.timings);
                    results.push(match outcome.status {
                        InsertStatus::Inserted => DocumentResult {
                            content_name: name,
                            status: DocumentStatus::Success,
                            document_id: outcome.document_id,
                            reason: None,
                        },
                        InsertStatus::Skipped => DocumentResult::skipped(&name, "already exists"),
                    });
                }
                Err(e) => results.push(DocumentResult::failed(&name, e.to_string())),
            }
        }

        let count = |status: DocumentStatus| results.iter().filter(|r| r.status == status).count();
        let succeeded = count(DocumentStatus::Success);
        let skipped = count(DocumentStatus::Skipped);
        let failed = count(DocumentStatus::Failed);
        timings.total_ms = elapsed_ms(started);

        tracing::info!(
            bot_id,
            total,
            succeeded,
            skipped,
            failed,
            total_ms = timings.total_ms,
            "batch insert finished"
        );
        Ok(BatchReport {
            status: OperationStatus::from_counts(succeeded + skipped, failed),
            total,
            succeeded,
            skipped,
            failed,
            results,
            timings,
        })
    }

    /// Delete documents by name: vectors first, then relational rows.
    pub async fn delete(
        &self,
        account_id: &str,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<DeleteReport> {
        let started = Instant::now();
        let (collection, partition) = self.target(account_id, bot_id)?;
        let mut timings = PhaseTimings::default();

        let mut requested: Vec<String> = Vec::with_capacity(content_names.len());
        for name in content_names {
            if !requested.contains(name) {
                requested.push(name.clone());
            }
        }

        let lookup_started = Instant::now();
        let existing = self
            .documents
            .existing_content_names(bot_id, &requested)
            .await?;
        timings.relational_ms += elapsed_ms(lookup_started);

        let (found, missing): (Vec<String>, Vec<String>) =
            requested.iter().cloned().partition(|n| existing.contains(n));
        let mut results: Vec<DocumentResult> = missing
            .iter()
            .map(|n| DocumentResult::failed(n, "not found"))
            .collect();
        let mut report = DeleteReport {
            status: OperationStatus::Failed,
            requested: requested.len(),
            documents_deleted: 0,
            chunks_deleted: 0,
            vectors_deleted: 0,
            results: Vec::new(),
            consistency_warning: None,
            timings,
        };

        if found.is_empty() {
            report.results = results;
            report.timings.total_ms = elapsed_ms(started);
            return Ok(report);
        }

        let vector_started = Instant::now();
        let filter = VectorFilter::for_bot(bot_id).with_content_names(found.clone());
        let vectors = RetryableOperation::new("vector delete", self.settings.retry)
            .run(|| self.vectors.delete_by_filter(&collection, &partition, &filter))
            .await;
        report.timings.vector_ms = elapsed_ms(vector_started);
        report.vectors_deleted = match vectors {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(bot_id, error = %e, "vector delete failed, nothing removed");
                results.extend(found.iter().map(|n| DocumentResult::failed(n, e.to_string())));
                report.results = results;
                report.timings.total_ms = elapsed_ms(started);
                return Ok(report);
            }
        };
        self.flusher.mark_dirty(&collection);

        let relational_started = Instant::now();
        let rows = RetryableOperation::new("relational delete", self.settings.retry)
            .run(|| self.documents.delete_by_content_names(bot_id, &found))
            .await;
        report.timings.relational_ms += elapsed_ms(relational_started);
        match rows {
            Ok(rows) => {
                report.documents_deleted = rows.documents;
                report.chunks_deleted = rows.chunks;
                results.extend(found.iter().map(|n| DocumentResult {
                    content_name: n.clone(),
                    status: DocumentStatus::Success,
                    document_id: None,
                    reason: None,
                }));
            }
            Err(e) => {
                report.consistency_warning = Some(ConsistencyWarning::raise(
                    "delete",
                    bot_id,
                    found.clone(),
                    report.vectors_deleted,
                    &e,
                ));
                results.extend(found.iter().map(|n| DocumentResult::failed(n, e.to_string())));
            }
        }

        let succeeded = results
            .iter()
            .filter(|r| r.status == DocumentStatus::Success)
            .count();
        report.status = OperationStatus::from_counts(succeeded, requested.len() - succeeded);
        report.results = results;
        report.timings.total_ms = elapsed_ms(started);
        tracing::info!(
            bot_id,
            requested = report.requested,
            documents = report.documents_deleted,
            vectors = report.vectors_deleted,
            total_ms = report.timings.total_ms,
            "delete finished"
        );
        Ok(report)
    }

    /// Remove everything stored for a bot: its vectors, its relational
    /// rows, and its partition with the tracking record once nothing else
    /// lives there.
    ///
    /// Bot ids that differ only in hyphens share a partition name, so the
    /// vectors are deleted by `bot_id` rather than by dropping the
    /// partition outright.
    pub async fn delete_bot_data(&self, account_id: &str, bot_id: &str) -> Result<BotDeleteReport> {
        let started = Instant::now();
        let (collection, partition) = self.target(account_id, bot_id)?;
        let mut timings = PhaseTimings::default();

        let vector_started = Instant::now();
        let filter = VectorFilter::for_bot(bot_id);
        let deleted = RetryableOperation::new("bot vector delete", self.settings.retry)
            .run(|| self.vectors.delete_by_filter(&collection, &partition, &filter))
            .await;
        let vectors_deleted = match deleted {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if vectors_deleted > 0 {
            self.flusher.mark_dirty(&collection);
        }

        let remaining = RetryableOperation::new("partition row count", self.settings.retry)
            .run(|| self.vectors.count_rows(&collection, &partition))
            .await;
        let partition_dropped = match remaining {
            Ok(0) => {
                let dropped = RetryableOperation::new("partition drop", self.settings.retry)
                    .run(|| self.vectors.drop_partition(&collection, &partition))
                    .await;
                match dropped {
                    Ok(_) => true,
                    Err(e) if e.kind() == ErrorKind::NotFound => true,
                    Err(e) => return Err(e),
                }
            }
            Ok(rows) => {
                tracing::warn!(
                    bot_id,
                    partition = %partition,
                    rows,
                    "partition still holds rows of another bot, keeping it"
                );
                false
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e),
        };
        if partition_dropped {
            if let Err(e) = self.cache.forget(&collection, &partition).await {
                tracing::warn!(bot_id, error = %e, "could not forget partition record");
            }
        }
        timings.vector_ms = elapsed_ms(vector_started);

        let relational_started = Instant::now();
        let rows = RetryableOperation::new("relational bot delete", self.settings.retry)
            .run(|| self.documents.delete_bot_data(bot_id))
            .await;
        timings.relational_ms = elapsed_ms(relational_started);
        timings.total_ms = elapsed_ms(started);

        let report = match rows {
            Ok(rows) => BotDeleteReport {
                status: OperationStatus::Success,
                vectors_deleted,
                partition_dropped,
                documents_deleted: rows.documents,
                chunks_deleted: rows.chunks,
                consistency_warning: None,
                timings,
            },
            Err(e) => BotDeleteReport {
                status: OperationStatus::Failed,
                vectors_deleted,
                partition_dropped,
                documents_deleted: 0,
                chunks_deleted: 0,
                consistency_warning: Some(ConsistencyWarning::raise(
                    "delete_bot_data",
                    bot_id,
                    Vec::new(),
                    vectors_deleted,
                    &e,
                )),
                timings,
            },
        };
        tracing::info!(
            bot_id,
            vectors = report.vectors_deleted,
            documents = report.documents_deleted,
            total_ms = report.timings.total_ms,
            "bot data deleted"
        );
        Ok(report)
    }
}
