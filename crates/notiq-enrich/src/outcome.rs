//! Tagged result type for enrichment fetches.

use std::time::Duration;

/// Outcome of a single source fetch.
///
/// Expected conditions are variants, not errors, so callers are forced to
/// handle each case explicitly: not-found is success-with-empty-result,
/// privacy claims must never be cached or retried, and rate limits carry a
/// retry-after hint that is propagated without failing the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome<T> {
    /// The source returned data for this key.
    Found(T),
    /// The source has nothing for this key. No cache write.
    NotFound,
    /// The source rate-limited us. No cache write; retry later.
    RateLimited {
        /// Server-provided wait hint, when present.
        retry_after: Option<Duration>,
    },
    /// The person has claimed data removal. No cache write, do not retry.
    PrivacyClaimed,
    /// Transport or server failure; recorded and skipped.
    Failed(String),
}

impl<T> EnrichOutcome<T> {
    /// The payload, if this outcome carries one.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the blend must stop and refuse to cache anything for this
    /// key.
    pub const fn is_privacy_claimed(&self) -> bool {
        matches!(self, Self::PrivacyClaimed)
    }
}
