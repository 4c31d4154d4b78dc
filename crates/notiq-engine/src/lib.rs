//! Processing pipeline.
//!
//! A pool of workers pulls leased events from the durable queue and runs
//! each through enrichment, formatting, thread resolution, and delivery.
//! Enrichment failures degrade to an unenriched notification; delivery
//! failures drive the queue's retry and dead-letter policy; a delivery
//! timeout releases the lease so another worker can retry later.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pool;
pub mod records;
pub mod worker;

pub use pool::WorkerPool;
pub use records::{CrossReference, RecordStore, TracingRecordStore};
pub use worker::{
    EngineStats, NotifyTarget, Pipeline, PipelineConfig, PipelineWorker, ProcessOutcome,
};

use thiserror::Error;

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the pipeline itself.
///
/// Most failure modes are absorbed (enrichment) or routed into the queue
/// (delivery); only queue-backend failures surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable queue backend failed.
    #[error(transparent)]
    Queue(#[from] notiq_queue::QueueError),

    /// Worker shutdown did not finish within the grace period.
    #[error("worker shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Grace period that elapsed.
        timeout_seconds: u64,
    },
}
