//! Collection and partition naming rules.
//!
//! One collection per account, one partition per bot:
//!
//! | Input | Name |
//! |-------|------|
//! | account `acme` | `collection_acme` (prefix configurable) |
//! | bot `550e8400-e29b-41d4-a716-446655440000` | `bot_550e8400e29b41d4a716446655440000` |

use crate::error::{Result, SyncError};

pub const DEFAULT_COLLECTION_PREFIX: &str = "collection_";

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Derives vector-store names from account and bot ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    collection_prefix: String,
}

impl Naming {
    pub fn new(collection_prefix: impl Into<String>) -> Self {
        Self {
            collection_prefix: collection_prefix.into(),
        }
    }

    pub fn collection_name(&self, account_id: &str) -> Result<String> {
        if !is_identifier(account_id) {
            return Err(SyncError::InvalidInput(format!(
                "account id must be non-empty and contain only [A-Za-z0-9_]: '{}'",
                account_id
            )));
        }
        Ok(format!("{}{}", self.collection_prefix, account_id))
    }

    pub fn partition_name(&self, bot_id: &str) -> Result<String> {
        let compact = bot_id.replace('-', "");
        if !is_identifier(&compact) {
            return Err(SyncError::InvalidInput(format!(
                "bot id must contain only [A-Za-z0-9_-]: '{}'",
                bot_id
            )));
        }
        Ok(format!("bot_{}", compact))
    }
}

impl Default for Naming {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECTION_PREFIX)
    }
}
