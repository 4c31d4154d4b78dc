//! Persistent-store collaborator interface.
//!
//! The relational store lives outside this system; the pipeline only ever
//! fires writes at it after a successful delivery, never on the decision
//! path. The default implementation just logs, which is also what keeps
//! the pipeline runnable without the external store.

use std::{future::Future, pin::Pin};

use notiq_core::CanonicalEvent;
use tracing::{info, warn};

/// Boxed future alias used by the record store trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One attempt to correlate a reference across platforms.
///
/// Append-only observability: the pipeline writes these and never reads
/// them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossReference {
    /// Platform the reference was seen on.
    pub source_platform: String,
    /// Reference on the source platform (e.g. a transaction id).
    pub source_ref: String,
    /// Platform the reference points into.
    pub target_platform: String,
    /// Resolved reference on the target platform, when found.
    pub target_ref: Option<String>,
    /// Whether the correlation succeeded.
    pub success: bool,
    /// Error text when it did not.
    pub error: Option<String>,
}

/// Write-only view of the external persistent store.
///
/// All methods are infallible by contract: implementations swallow and log
/// their own errors so a slow or broken store can never block delivery.
pub trait RecordStore: Send + Sync + 'static {
    /// Persists a payment event record.
    fn save_payment_record<'a>(&'a self, event: &'a CanonicalEvent) -> BoxFuture<'a, ()>;

    /// Persists an e-commerce order record.
    fn save_order_record<'a>(&'a self, event: &'a CanonicalEvent) -> BoxFuture<'a, ()>;

    /// Appends a cross-reference correlation attempt.
    fn log_cross_reference(&self, reference: CrossReference) -> BoxFuture<'_, ()>;
}

/// Record store that only emits structured logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecordStore;

impl TracingRecordStore {
    /// Creates the store.
    pub fn new() -> Self {
        Self
    }
}

impl RecordStore for TracingRecordStore {
    fn save_payment_record<'a>(&'a self, event: &'a CanonicalEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(
                provider = %event.provider,
                external_id = %event.external_id,
                amount = %event.amount.display(&event.currency),
                "payment record saved"
            );
        })
    }

    fn save_order_record<'a>(&'a self, event: &'a CanonicalEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(
                provider = %event.provider,
                external_id = %event.external_id,
                order = event.metadata("order_number").unwrap_or("unknown"),
                "order record saved"
            );
        })
    }

    fn log_cross_reference(&self, reference: CrossReference) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if reference.success {
                info!(
                    source = %reference.source_platform,
                    source_ref = %reference.source_ref,
                    target = %reference.target_platform,
                    target_ref = reference.target_ref.as_deref().unwrap_or("none"),
                    "cross-reference logged"
                );
            } else {
                warn!(
                    source = %reference.source_platform,
                    source_ref = %reference.source_ref,
                    target = %reference.target_platform,
                    error = reference.error.as_deref().unwrap_or("unknown"),
                    "cross-reference lookup failed"
                );
            }
        })
    }
}
