//! Tenant and bot provisioning.
//!
//! Creating a collection or registering a bot is idempotent: repeating it
//! reports what already existed instead of failing.

use std::sync::Arc;

use serde::Serialize;

use ragsync_core::models::{BotStats, LoadState};
use ragsync_core::naming::Naming;
use ragsync_core::store::DocumentStore;
use ragsync_core::vector::VectorStore;
use ragsync_core::Result;

use crate::partition_cache::PartitionCache;
use crate::retry::{RetryPolicy, RetryableOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created,
    AlreadyExists,
}

impl ProvisionOutcome {
    fn from_created(created: bool) -> Self {
        if created {
            Self::Created
        } else {
            Self::AlreadyExists
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    pub dimension: usize,
    pub outcome: ProvisionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotRegistration {
    pub collection: String,
    pub partition: String,
    pub partition_outcome: ProvisionOutcome,
    pub registry_outcome: ProvisionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotStatsReport {
    pub collection: String,
    pub partition: String,
    pub load_state: LoadState,
    pub tracked: bool,
    #[serde(flatten)]
    pub stats: BotStats,
}

pub struct Provisioner {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    cache: Arc<PartitionCache>,
    naming: Naming,
    dimension: usize,
    retry: RetryPolicy,
}

impl Provisioner {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        cache: Arc<PartitionCache>,
        naming: Naming,
        dimension: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            documents,
            vectors,
            cache,
            naming,
            dimension,
            retry,
        }
    }

    /// Create the collection for an account.
    pub async fn create_collection(&self, account_id: &str) -> Result<CollectionReport> {
        let collection = self.naming.collection_name(account_id)?;
        let created = RetryableOperation::new("create collection", self.retry)
            .run(|| self.vectors.create_collection(&collection, self.dimension))
            .await?;
        tracing::info!(account_id, collection = %collection, created, "collection provisioned");
        Ok(CollectionReport {
            collection,
            dimension: self.dimension,
            outcome: ProvisionOutcome::from_created(created),
        })
    }

    /// Create the bot's partition, then its registry row.
    ///
    /// The account's collection must already exist.
    pub async fn register_bot(
        &self,
        account_id: &str,
        bot_id: &str,
        bot_name: &str,
    ) -> Result<BotRegistration> {
        let collection = self.naming.collection_name(account_id)?;
        let partition = self.naming.partition_name(bot_id)?;

        let partition_created = RetryableOperation::new("create partition", self.retry)
            .run(|| self.vectors.create_partition(&collection, &partition))
            .await?;
        let registered = RetryableOperation::new("register bot", self.retry)
            .run(|| self.documents.register_bot(account_id, bot_id, bot_name))
            .await?;

        tracing::info!(
            account_id,
            bot_id,
            partition = %partition,
            partition_created,
            registered,
            "bot registered"
        );
        Ok(BotRegistration {
            collection,
            partition,
            partition_outcome: ProvisionOutcome::from_created(partition_created),
            registry_outcome: ProvisionOutcome::from_created(registered),
        })
    }

    pub async fn bot_stats(&self, account_id: &str, bot_id: &str) -> Result<BotStatsReport> {
        let collection = self.naming.collection_name(account_id)?;
        let partition = self.naming.partition_name(bot_id)?;
        let stats = self.documents.bot_stats(bot_id).await?;
        let load_state = self
            .vectors
            .get_load_state(&collection, Some(&partition))
            .await?;
        let tracked = self.cache.is_tracked(&collection, &partition).await?;
        Ok(BotStatsReport {
            collection,
            partition,
            load_state,
            tracked,
            stats,
        })
    }
}
