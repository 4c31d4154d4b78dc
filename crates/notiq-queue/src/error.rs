//! Error types for queue operations.

use thiserror::Error;

/// Result type alias using [`QueueError`].
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by the durable queue and audit store.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend storage operation failed.
    #[error("queue storage error: {0}")]
    Storage(String),

    /// A persisted record could not be (de)serialized.
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced queue record no longer exists.
    #[error("queue record not found: {queue_key}")]
    RecordNotFound {
        /// Idempotency key of the missing record.
        queue_key: String,
    },

    /// The caller does not hold the lease it tried to use.
    #[error("lease not held for {queue_key}")]
    LeaseNotHeld {
        /// Idempotency key of the contested record.
        queue_key: String,
    },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl QueueError {
    /// Whether the operation may succeed if retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
