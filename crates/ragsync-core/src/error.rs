//! Error taxonomy for cross-store operations.
//!
//! Every backend call returns [`SyncError`], and callers branch on
//! [`SyncError::kind`] instead of inspecting message text.
//!
//! | Kind | Retried | Typical source |
//! |------|---------|----------------|
//! | [`ErrorKind::NotFound`] | no | missing collection, partition, or document |
//! | [`ErrorKind::Duplicate`] | no | pre-check hit or unique-constraint violation |
//! | [`ErrorKind::InvalidInput`] | no | malformed names, empty chunk lists, bad dimensions |
//! | [`ErrorKind::Transient`] | yes | network blips, rate limits, backend 5xx |
//! | [`ErrorKind::Terminal`] | no | everything else, including exhausted retries |

use thiserror::Error;

/// Errors produced by stores, clients, and the coordinators built on them.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// A collection, partition, bot, or document does not exist.
    #[error("{what} not found: {name}")]
    NotFound {
        /// What kind of entity was looked up.
        what: &'static str,
        /// The name or id that was not found.
        name: String,
    },

    /// The entity already exists.
    #[error("already exists: {0}")]
    Duplicate(String),

    /// The request itself is malformed and will never succeed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A retryable backend failure.
    #[error("transient {backend} error: {message}")]
    Transient {
        /// The backend that failed (`vector`, `relational`, `embedding`, `kv`).
        backend: &'static str,
        /// A description of the failure.
        message: String,
    },

    /// An unrecoverable failure for this request.
    #[error("{backend} error: {message}")]
    Terminal {
        /// The backend that failed.
        backend: &'static str,
        /// A description of the failure.
        message: String,
    },
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    InvalidInput,
    Transient,
    Terminal,
}

impl SyncError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        SyncError::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn transient(backend: &'static str, message: impl Into<String>) -> Self {
        SyncError::Transient {
            backend,
            message: message.into(),
        }
    }

    pub fn terminal(backend: &'static str, message: impl Into<String>) -> Self {
        SyncError::Terminal {
            backend,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::Duplicate(_) => ErrorKind::Duplicate,
            SyncError::InvalidInput(_) => ErrorKind::InvalidInput,
            SyncError::Transient { .. } => ErrorKind::Transient,
            SyncError::Terminal { .. } => ErrorKind::Terminal,
        }
    }

    /// Only transient backend failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Escalate a transient failure once its retry budget is spent.
    ///
    /// Non-transient errors are returned unchanged.
    pub fn exhausted(self, attempts: u32) -> Self {
        match self {
            SyncError::Transient { backend, message } => SyncError::Terminal {
                backend,
                message: format!("gave up after {} attempts: {}", attempts, message),
            },
            other => other,
        }
    }
}

/// A convenience result type for store and coordinator operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(SyncError::transient("vector", "timeout").is_retryable());
        assert!(!SyncError::terminal("vector", "schema mismatch").is_retryable());
        assert!(!SyncError::Duplicate("bot/a".into()).is_retryable());
        assert!(!SyncError::not_found("collection", "collection_x").is_retryable());
    }

    #[test]
    fn test_exhausted_escalates_transient() {
        let err = SyncError::transient("embedding", "429").exhausted(4);
        assert_eq!(err.kind(), ErrorKind::Terminal);
        assert!(err.to_string().contains("gave up after 4 attempts"));
    }

    #[test]
    fn test_exhausted_keeps_other_kinds() {
        let err = SyncError::not_found("partition", "bot_1").exhausted(4);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
