//! Queue record types.

use chrono::{DateTime, Utc};
use notiq_core::{CanonicalEvent, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durably persisted event awaiting delivery.
///
/// Created on receipt, before any processing, and removed only after
/// successful end-to-end delivery or dead-lettering. The owner token and
/// lease expiry live in the backend, not in process memory, because the
/// claimant may itself crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Idempotency key: `{provider}:{external_id}`.
    pub queue_key: String,
    /// Tenant the event belongs to.
    pub tenant_id: TenantId,
    /// The canonical event payload.
    pub event: CanonicalEvent,
    /// When the event was first persisted.
    pub enqueued_at: DateTime<Utc>,
    /// Completed delivery attempts so far.
    pub attempt_count: u32,
    /// Error text from the most recent failed attempt.
    pub last_error: Option<String>,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueue {
    /// The event was durably persisted.
    Enqueued {
        /// Idempotency key assigned to the record.
        queue_key: String,
    },
    /// An event with the same `(provider, external_id)` is already pending
    /// or was recently delivered; nothing new was persisted.
    Duplicate {
        /// Idempotency key of the pre-existing record.
        queue_key: String,
    },
}

impl Enqueue {
    /// The queue key regardless of outcome.
    pub fn queue_key(&self) -> &str {
        match self {
            Self::Enqueued { queue_key } | Self::Duplicate { queue_key } => queue_key,
        }
    }
}

/// Result of scheduling a retry after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The event was rescheduled with backoff.
    Scheduled {
        /// When the next attempt becomes due.
        next_attempt_at: DateTime<Utc>,
        /// Attempts completed so far.
        attempt_count: u32,
    },
    /// The retry ceiling was reached; the event moved to the dead-letter
    /// area for operator inspection.
    DeadLettered,
}

/// A terminally failed event awaiting manual intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The full pending record at the time of failure.
    pub pending: PendingEvent,
    /// Final error that exhausted the retries.
    pub error: String,
    /// When the event was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// Opaque worker identity used for lease ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Creates a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
