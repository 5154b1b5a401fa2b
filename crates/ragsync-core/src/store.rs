//! Relational document store abstraction.
//!
//! The relational store is authoritative for document existence. It owns
//! the `(bot_id, content_name)` uniqueness constraint and holds the full
//! metadata map for every document.
//!
//! Implementations must be `Send + Sync` to be shared across tasks.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BotStats, DeletedRows, NewDocument, StoredDocument};

/// Abstract relational backend for documents, chunks, and the bot registry.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`existing_content_names`](DocumentStore::existing_content_names) | Duplicate pre-check |
/// | [`insert_document`](DocumentStore::insert_document) | Transactional document + chunks insert |
/// | [`delete_document`](DocumentStore::delete_document) | Compensating delete by id (cascades) |
/// | [`get_document`](DocumentStore::get_document) | Lookup by natural key |
/// | [`documents_by_ids`](DocumentStore::documents_by_ids) | Search-result join |
/// | [`delete_by_content_names`](DocumentStore::delete_by_content_names) | Bulk delete for one bot |
/// | [`delete_bot_data`](DocumentStore::delete_bot_data) | Remove everything for one bot |
/// | [`register_bot`](DocumentStore::register_bot) | Idempotent bot registration |
/// | [`bot_stats`](DocumentStore::bot_stats) | Per-bot counts |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return the subset of `content_names` that already exist for `bot_id`.
    async fn existing_content_names(
        &self,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<HashSet<String>>;

    /// Insert the document row and all chunk rows in one transaction.
    ///
    /// Returns the new document id.
    ///
    /// # Errors
    ///
    /// [`SyncError::Duplicate`](crate::SyncError::Duplicate) when the
    /// `(bot_id, content_name)` constraint is violated. Nothing is written in
    /// that case.
    async fn insert_document(&self, doc: &NewDocument) -> Result<i64>;

    /// Delete one document by id. Chunks go with it.
    ///
    /// Returns `false` if the row was already gone.
    async fn delete_document(&self, document_id: i64) -> Result<bool>;

    async fn get_document(&self, bot_id: &str, content_name: &str)
        -> Result<Option<StoredDocument>>;

    /// Fetch documents with their chunks. Unknown ids are silently absent.
    async fn documents_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredDocument>>;

    async fn delete_by_content_names(
        &self,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<DeletedRows>;

    /// Delete every document of `bot_id` and its registry row.
    async fn delete_bot_data(&self, bot_id: &str) -> Result<DeletedRows>;

    /// Register a bot. Returns `false` if it was already registered.
    async fn register_bot(&self, account_id: &str, bot_id: &str, bot_name: &str)
        -> Result<bool>;

    async fn bot_stats(&self, bot_id: &str) -> Result<BotStats>;
}
