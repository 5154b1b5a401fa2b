//! In-memory [`VectorStore`] implementation for tests and local runs.
//!
//! Mirrors the visibility rules of a real ANN store closely enough to
//! exercise the service layer:
//!
//! - inserted rows land in a *growing* segment and are only searchable
//!   after [`flush`](VectorStore::flush) seals them;
//! - search requires every requested partition to be loaded;
//! - search is brute-force cosine similarity.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Result, SyncError};
use crate::models::LoadState;

use super::{VectorFilter, VectorHit, VectorRow, VectorStore};

#[derive(Default)]
struct MemPartition {
    sealed: Vec<VectorRow>,
    growing: Vec<VectorRow>,
    loaded: bool,
}

impl MemPartition {
    fn row_count(&self) -> usize {
        self.sealed.len() + self.growing.len()
    }
}

struct MemCollection {
    dimension: usize,
    partitions: BTreeMap<String, MemPartition>,
}

/// In-memory vector store.
pub struct InMemoryVectorStore {
    collections: RwLock<BTreeMap<String, MemCollection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of loaded partitions across all collections.
    pub fn loaded_partition_count(&self) -> usize {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections
            .values()
            .flat_map(|c| c.partitions.values())
            .filter(|p| p.loaded)
            .count()
    }

    pub fn is_loaded(&self, collection: &str, partition: &str) -> bool {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .and_then(|c| c.partitions.get(partition))
            .map(|p| p.loaded)
            .unwrap_or(false)
    }

    /// Rows in a partition, flushed or not.
    pub fn row_count(&self, collection: &str, partition: &str) -> usize {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .and_then(|c| c.partitions.get(partition))
            .map(MemPartition::row_count)
            .unwrap_or(0)
    }

    /// All rows in a partition, flushed or not, in insertion order.
    pub fn rows(&self, collection: &str, partition: &str) -> Vec<VectorRow> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .and_then(|c| c.partitions.get(partition))
            .map(|p| p.sealed.iter().chain(p.growing.iter()).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_collection(collection: &str) -> SyncError {
    SyncError::not_found("collection", collection)
}

fn missing_partition(collection: &str, partition: &str) -> SyncError {
    SyncError::not_found("partition", format!("{}/{}", collection, partition))
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, collection: &str, dimension: usize) -> Result<bool> {
        if dimension == 0 {
            return Err(SyncError::InvalidInput(
                "collection dimension must be > 0".to_string(),
            ));
        }
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if collections.contains_key(collection) {
            return Ok(false);
        }
        collections.insert(
            collection.to_string(),
            MemCollection {
                dimension,
                partitions: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn create_partition(&self, collection: &str, partition: &str) -> Result<bool> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        if coll.partitions.contains_key(partition) {
            return Ok(false);
        }
        coll.partitions
            .insert(partition.to_string(), MemPartition::default());
        Ok(true)
    }

    async fn drop_partition(&self, collection: &str, partition: &str) -> Result<u64> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        Ok(coll
            .partitions
            .remove(partition)
            .map(|p| p.row_count() as u64)
            .unwrap_or(0))
    }

    async fn count_rows(&self, collection: &str, partition: &str) -> Result<u64> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        Ok(coll
            .partitions
            .get(partition)
            .map(|p| p.row_count() as u64)
            .unwrap_or(0))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        Ok(collections.keys().cloned().collect())
    }

    async fn list_partitions(&self, collection: &str) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        Ok(coll.partitions.keys().cloned().collect())
    }

    async fn load_partition(&self, collection: &str, partition: &str) -> Result<()> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        let part = coll
            .partitions
            .get_mut(partition)
            .ok_or_else(|| missing_partition(collection, partition))?;
        part.loaded = true;
        Ok(())
    }

    async fn release_partition(&self, collection: &str, partition: &str) -> Result<()> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        let part = coll
            .partitions
            .get_mut(partition)
            .ok_or_else(|| missing_partition(collection, partition))?;
        part.loaded = false;
        Ok(())
    }

    async fn get_load_state(
        &self,
        collection: &str,
        partition: Option<&str>,
    ) -> Result<LoadState> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let Some(coll) = collections.get(collection) else {
            return Ok(LoadState::NotExist);
        };
        let state = match partition {
            Some(name) => match coll.partitions.get(name) {
                None => LoadState::NotExist,
                Some(p) if p.loaded => LoadState::Loaded,
                Some(_) => LoadState::NotLoad,
            },
            None if coll.partitions.values().any(|p| p.loaded) => LoadState::Loaded,
            None => LoadState::NotLoad,
        };
        Ok(state)
    }

    async fn insert_vectors(
        &self,
        collection: &str,
        partition: &str,
        rows: Vec<VectorRow>,
    ) -> Result<usize> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        let dimension = coll.dimension;
        if let Some(bad) = rows.iter().find(|r| r.embedding.len() != dimension) {
            return Err(SyncError::InvalidInput(format!(
                "vector for '{}' chunk {} has {} dimensions, collection expects {}",
                bad.content_name,
                bad.chunk_index,
                bad.embedding.len(),
                dimension
            )));
        }
        let part = coll
            .partitions
            .get_mut(partition)
            .ok_or_else(|| missing_partition(collection, partition))?;
        let written = rows.len();
        part.growing.extend(rows);
        Ok(written)
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        partition: &str,
        filter: &VectorFilter,
    ) -> Result<u64> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        let Some(part) = coll.partitions.get_mut(partition) else {
            return Ok(0);
        };
        let before = part.row_count();
        part.sealed.retain(|r| !filter.matches(r));
        part.growing.retain(|r| !filter.matches(r));
        Ok((before - part.row_count()) as u64)
    }

    async fn flush(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        for part in coll.partitions.values_mut() {
            let growing = std::mem::take(&mut part.growing);
            part.sealed.extend(growing);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        partitions: &[String],
        query: &[f32],
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;

        let mut hits = Vec::new();
        for name in partitions {
            let part = coll
                .partitions
                .get(name)
                .ok_or_else(|| missing_partition(collection, name))?;
            if !part.loaded {
                return Err(SyncError::terminal(
                    "vector",
                    format!("partition {}/{} is not loaded", collection, name),
                ));
            }
            for row in &part.sealed {
                if filter.map(|f| f.matches(row)).unwrap_or(true) {
                    hits.push(VectorHit {
                        document_id: row.document_id,
                        bot_id: row.bot_id.clone(),
                        content_name: row.content_name.clone(),
                        chunk_index: row.chunk_index,
                        score: cosine_similarity(query, &row.embedding),
                        metadata: row.metadata.clone(),
                    });
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}
