//! Core data models shared by the stores and the service layer.
//!
//! These types carry no behavior beyond small accessors; persistence lives
//! behind the traits in [`crate::store`], [`crate::vector`], and [`crate::kv`].

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// One text fragment of a document, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInput {
    /// Zero-based position of the chunk within the document.
    pub index: i64,
    pub text: String,
}

/// A document about to be written to the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub account_id: String,
    pub bot_id: String,
    /// Caller-supplied natural key (URL, filename, title), unique per bot.
    pub content_name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub chunks: Vec<ChunkInput>,
}

/// A chunk row as read back from the relational store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChunk {
    pub chunk_index: i64,
    pub text: String,
}

/// A document row with its chunks, as read back from the relational store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub id: i64,
    pub account_id: String,
    pub bot_id: String,
    pub content_name: String,
    pub metadata: Metadata,
    pub chunk_count: i64,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    pub chunks: Vec<StoredChunk>,
}

impl StoredDocument {
    pub fn chunk(&self, index: i64) -> Option<&StoredChunk> {
        self.chunks.iter().find(|c| c.chunk_index == index)
    }
}

/// Row counts removed by a relational delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletedRows {
    pub documents: u64,
    pub chunks: u64,
}

/// Relational counts for one bot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BotStats {
    pub bot_id: String,
    pub registered: bool,
    pub documents: u64,
    pub chunks: u64,
}

/// Identity of one partition within one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub collection: String,
    pub partition: String,
}

impl PartitionKey {
    pub fn new(collection: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            partition: partition.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.partition)
    }
}

/// The tracked belief that a partition is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub collection: String,
    pub partition: String,
    pub loaded_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

impl PartitionRecord {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(&self.collection, &self.partition)
    }

    /// Time since last access, clamped at zero.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_access_at).max(Duration::zero())
    }
}

/// Load state as reported by the vector store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    NotExist,
    NotLoad,
    Loading,
    Loaded,
}
