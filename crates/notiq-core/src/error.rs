//! Ingestion error taxonomy.
//!
//! Splits failures into the categories the HTTP layer and the queue care
//! about: signature problems and malformed payloads are rejected outright
//! (the provider must not retry), while a missing customer record is
//! retryable because the provider's own data may simply not have propagated
//! yet.

use thiserror::Error;

/// Result type alias using [`IngestError`].
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised while validating and parsing an inbound webhook.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    /// Signature header missing, malformed, or mismatched.
    ///
    /// Mapped to HTTP 400; the provider must not retry.
    #[error("invalid webhook signature: {reason}")]
    InvalidSignature {
        /// What failed during validation.
        reason: String,
    },

    /// Payload could not be parsed into a canonical event.
    ///
    /// Mapped to HTTP 400; logged with the offending field.
    #[error("invalid webhook payload: {reason}")]
    InvalidPayload {
        /// What was missing or malformed.
        reason: String,
    },

    /// Request body carried an unexpected content type.
    ///
    /// Mapped to HTTP 415.
    #[error("unsupported content type: expected {expected}, got {got}")]
    UnsupportedContentType {
        /// Content type the provider's adapter requires.
        expected: &'static str,
        /// Content type actually received.
        got: String,
    },

    /// The referenced customer does not exist (yet).
    ///
    /// Retryable: provider-side records can lag behind the webhook.
    #[error("customer not found: {customer_id}")]
    CustomerNotFound {
        /// Provider-side customer identifier.
        customer_id: String,
    },
}

impl IngestError {
    /// Creates an invalid-signature error.
    pub fn signature(reason: impl Into<String>) -> Self {
        Self::InvalidSignature { reason: reason.into() }
    }

    /// Creates an invalid-payload error.
    pub fn payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload { reason: reason.into() }
    }

    /// Whether processing may be retried later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CustomerNotFound { .. })
    }
}
