//! Read path: normalize the query, ensure the bot's partition is loaded,
//! embed the query, search, and join hits with relational rows.
//!
//! Queries are trimmed, runs of whitespace collapse to one space, and the
//! result is capped at [`MAX_QUERY_CHARS`] characters before embedding.
//! Hits can be narrowed by exact values of metadata fields mirrored into
//! the vector rows; asking for a field outside the allow-list is an error,
//! since no vector row could ever carry it.
//!
//! Hits whose document row has disappeared (deleted between the vector
//! search and the join) are dropped with a warning rather than returned
//! half-empty.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use ragsync_core::embedding::EmbeddingClient;
use ragsync_core::metadata::{Metadata, MetadataAllowList};
use ragsync_core::models::StoredDocument;
use ragsync_core::naming::Naming;
use ragsync_core::store::DocumentStore;
use ragsync_core::vector::{VectorFilter, VectorStore};
use ragsync_core::{Result, SyncError};

use crate::embedding::embed_in_batches;
use crate::partition_cache::PartitionCache;
use crate::retry::{RetryPolicy, RetryableOperation};

/// Largest `limit` a search may ask for.
pub const MAX_SEARCH_LIMIT: usize = 128;

/// Longest query, in characters, passed to the embedder.
pub const MAX_QUERY_CHARS: usize = 8000;

/// Trim, collapse whitespace runs to a single space, and cap at
/// [`MAX_QUERY_CHARS`] characters.
pub fn normalize_query(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(MAX_QUERY_CHARS) {
        Some((cut, _)) => collapsed[..cut].to_string(),
        None => collapsed,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub account_id: String,
    pub bot_id: String,
    pub query: String,
    pub limit: usize,
    /// Restrict hits to these documents.
    #[serde(default)]
    pub content_names: Option<Vec<String>>,
    /// Exact values required of mirrored metadata fields.
    #[serde(default)]
    pub metadata_filter: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: i64,
    pub content_name: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: Option<String>,
    /// Full relational metadata, not just the allow-listed vector fields.
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SearchTimings {
    pub load_ms: u64,
    pub embedding_ms: u64,
    pub vector_ms: u64,
    pub relational_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Vector hits dropped because their document row was missing.
    pub dropped: usize,
    pub timings: SearchTimings,
}

pub struct SearchService {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    cache: Arc<PartitionCache>,
    naming: Naming,
    allow_list: MetadataAllowList,
    retry: RetryPolicy,
}

impl SearchService {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        cache: Arc<PartitionCache>,
        naming: Naming,
        allow_list: MetadataAllowList,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            documents,
            vectors,
            embedder,
            cache,
            naming,
            allow_list,
            retry,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let mut timings = SearchTimings::default();

        let query = normalize_query(&request.query);
        if query.is_empty() {
            return Err(SyncError::InvalidInput("query is empty".to_string()));
        }
        if request.limit == 0 {
            return Err(SyncError::InvalidInput("limit must be at least 1".to_string()));
        }
        if let Some(fields) = &request.metadata_filter {
            if let Some(key) = fields.keys().find(|k| !self.allow_list.contains(k)) {
                return Err(SyncError::InvalidInput(format!(
                    "metadata field '{}' is not mirrored into vectors",
                    key
                )));
            }
        }
        let limit = request.limit.min(MAX_SEARCH_LIMIT);
        let collection = self.naming.collection_name(&request.account_id)?;
        let partition = self.naming.partition_name(&request.bot_id)?;

        let load_started = Instant::now();
        let loaded = self.cache.ensure_loaded(&collection, &partition, false).await;
        timings.load_ms = elapsed_ms(load_started);
        if !loaded {
            return Err(SyncError::not_found(
                "partition",
                format!("{}/{}", collection, partition),
            ));
        }

        let embedding_started = Instant::now();
        let query_vector = embed_in_batches(
            self.embedder.as_ref(),
            std::slice::from_ref(&query),
            1,
            self.retry,
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::terminal("embedding", "empty embedding response"))?;
        timings.embedding_ms = elapsed_ms(embedding_started);

        let mut filter = VectorFilter::for_bot(&request.bot_id);
        if let Some(names) = &request.content_names {
            filter = filter.with_content_names(names.clone());
        }
        if let Some(fields) = &request.metadata_filter {
            filter = filter.with_metadata(fields.clone());
        }
        let partitions = [partition];
        let vector_started = Instant::now();
        let hits = RetryableOperation::new("vector search", self.retry)
            .run(|| {
                self.vectors
                    .search(&collection, &partitions, &query_vector, limit, Some(&filter))
            })
            .await?;
        timings.vector_ms = elapsed_ms(vector_started);

        let relational_started = Instant::now();
        let ids: Vec<i64> = hits
            .iter()
            .map(|h| h.document_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let documents: HashMap<i64, StoredDocument> = self
            .documents
            .documents_by_ids(&ids)
            .await?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        timings.relational_ms = elapsed_ms(relational_started);

        let mut dropped = 0;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(doc) = documents.get(&hit.document_id) else {
                tracing::warn!(
                    document_id = hit.document_id,
                    content_name = %hit.content_name,
                    "vector hit without document row, dropping"
                );
                dropped += 1;
                continue;
            };
            results.push(SearchHit {
                document_id: hit.document_id,
                content_name: doc.content_name.clone(),
                chunk_index: hit.chunk_index,
                score: hit.score,
                text: doc.chunk(hit.chunk_index).map(|c| c.text.clone()),
                metadata: doc.metadata.clone(),
            });
        }

        timings.total_ms = elapsed_ms(started);
        tracing::debug!(
            bot_id = %request.bot_id,
            hits = results.len(),
            dropped,
            total_ms = timings.total_ms,
            "search finished"
        );
        Ok(SearchResponse {
            hits: results,
            dropped,
            timings,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
