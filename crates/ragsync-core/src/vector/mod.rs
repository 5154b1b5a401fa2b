//! Vector store abstraction.
//!
//! The vector store is authoritative for similarity search. Its data is
//! organised as collections (one per account) subdivided into partitions
//! (one per bot). A partition must be loaded into memory before it can be
//! searched, and inserted rows become searchable only after a flush.
//!
//! Wire clients render [`VectorFilter`] into their own expression language
//! via [`VectorFilter::to_expr`]; the in-memory store evaluates it directly.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::metadata::Metadata;
use crate::models::LoadState;

/// One vector entity, written per chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRow {
    pub document_id: i64,
    pub bot_id: String,
    pub content_name: String,
    pub chunk_index: i64,
    pub embedding: Vec<f32>,
    /// Allow-listed subset of the document metadata.
    pub metadata: Metadata,
}

/// A similarity search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub document_id: i64,
    pub bot_id: String,
    pub content_name: String,
    pub chunk_index: i64,
    pub score: f32,
    pub metadata: Metadata,
}

/// Row filter for deletes and searches.
///
/// Always scoped to one bot; optionally narrowed to specific content names,
/// document ids, or exact values of mirrored metadata fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorFilter {
    pub bot_id: String,
    pub content_names: Option<Vec<String>>,
    pub document_ids: Option<Vec<i64>>,
    pub metadata: Option<Metadata>,
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let list: Vec<String> = items.iter().map(literal).collect();
            format!("[{}]", list.join(", "))
        }
        other => other.to_string(),
    }
}

impl VectorFilter {
    pub fn for_bot(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            content_names: None,
            document_ids: None,
            metadata: None,
        }
    }

    pub fn with_content_names(mut self, names: Vec<String>) -> Self {
        self.content_names = Some(names);
        self
    }

    pub fn with_document_ids(mut self, ids: Vec<i64>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    /// Require each given metadata field to equal the given value.
    pub fn with_metadata(mut self, fields: Metadata) -> Self {
        self.metadata = Some(fields);
        self
    }

    pub fn matches(&self, row: &VectorRow) -> bool {
        if row.bot_id != self.bot_id {
            return false;
        }
        if let Some(names) = &self.content_names {
            if !names.iter().any(|n| n == &row.content_name) {
                return false;
            }
        }
        if let Some(ids) = &self.document_ids {
            if !ids.contains(&row.document_id) {
                return false;
            }
        }
        if let Some(fields) = &self.metadata {
            if !fields
                .iter()
                .all(|(key, value)| row.metadata.get(key) == Some(value))
            {
                return false;
            }
        }
        true
    }

    /// Render as a boolean expression over `bot_id`, `content_name`,
    /// `doc_id` and the `metadata` JSON field.
    ///
    /// ```rust
    /// use ragsync_core::vector::VectorFilter;
    ///
    /// let f = VectorFilter::for_bot("b1").with_content_names(vec!["a.pdf".into(), "it's".into()]);
    /// assert_eq!(f.to_expr(), r"bot_id == 'b1' and content_name in ['a.pdf', 'it\'s']");
    /// ```
    pub fn to_expr(&self) -> String {
        let mut expr = format!("bot_id == {}", quote(&self.bot_id));
        if let Some(names) = &self.content_names {
            let list: Vec<String> = names.iter().map(|n| quote(n)).collect();
            expr.push_str(&format!(" and content_name in [{}]", list.join(", ")));
        }
        if let Some(ids) = &self.document_ids {
            let list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            expr.push_str(&format!(" and doc_id in [{}]", list.join(", ")));
        }
        if let Some(fields) = &self.metadata {
            for (key, value) in fields {
                let key = key.replace('\\', "\\\\").replace('"', "\\\"");
                expr.push_str(&format!(" and metadata[\"{}\"] == {}", key, literal(value)));
            }
        }
        expr
    }
}

/// Abstract vector-store backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_collection`](VectorStore::create_collection) | Create a tenant collection (idempotent) |
/// | [`create_partition`](VectorStore::create_partition) | Create a bot partition (idempotent) |
/// | [`drop_partition`](VectorStore::drop_partition) | Drop a partition and all its rows |
/// | [`count_rows`](VectorStore::count_rows) | Rows held by a partition |
/// | [`list_collections`](VectorStore::list_collections) | Enumerate collections |
/// | [`list_partitions`](VectorStore::list_partitions) | Enumerate partitions of a collection |
/// | [`load_partition`](VectorStore::load_partition) | Bring one partition into memory |
/// | [`release_partition`](VectorStore::release_partition) | Drop one partition from memory |
/// | [`get_load_state`](VectorStore::get_load_state) | Authoritative load state |
/// | [`insert_vectors`](VectorStore::insert_vectors) | Write rows into a partition |
/// | [`delete_by_filter`](VectorStore::delete_by_filter) | Delete matching rows |
/// | [`flush`](VectorStore::flush) | Make written rows searchable |
/// | [`search`](VectorStore::search) | Similarity search over loaded partitions |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Returns `false` if the collection already existed.
    async fn create_collection(&self, collection: &str, dimension: usize) -> Result<bool>;

    /// Returns `false` if the partition already existed.
    async fn create_partition(&self, collection: &str, partition: &str) -> Result<bool>;

    /// Drop a partition. Returns the number of rows it held; a missing
    /// partition yields `0`.
    async fn drop_partition(&self, collection: &str, partition: &str) -> Result<u64>;

    /// Rows in a partition, flushed or not. A missing partition yields `0`.
    async fn count_rows(&self, collection: &str, partition: &str) -> Result<u64>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn list_partitions(&self, collection: &str) -> Result<Vec<String>>;

    async fn load_partition(&self, collection: &str, partition: &str) -> Result<()>;

    async fn release_partition(&self, collection: &str, partition: &str) -> Result<()>;

    /// Load state of a collection (`partition = None`) or of one partition.
    async fn get_load_state(&self, collection: &str, partition: Option<&str>)
        -> Result<LoadState>;

    /// Returns the number of rows written.
    async fn insert_vectors(
        &self,
        collection: &str,
        partition: &str,
        rows: Vec<VectorRow>,
    ) -> Result<usize>;

    /// Returns the number of rows deleted.
    async fn delete_by_filter(
        &self,
        collection: &str,
        partition: &str,
        filter: &VectorFilter,
    ) -> Result<u64>;

    async fn flush(&self, collection: &str) -> Result<()>;

    async fn search(
        &self,
        collection: &str,
        partitions: &[String],
        query: &[f32],
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>>;
}
