//! Storage abstraction for the durable queue.
//!
//! The trait keeps delivery logic testable without a live Redis: production
//! uses [`crate::RedisQueueStore`], tests use [`crate::MemoryQueueStore`].
//! Both uphold the same contract: persist-before-acknowledge, one live
//! lease per key, and at-most-one delivered notification per
//! `(provider, external_id)`.

use std::{future::Future, pin::Pin};

use notiq_core::{CanonicalEvent, TenantId};

use crate::{
    error::Result,
    pending::{DeadLetter, Enqueue, OwnerToken, PendingEvent, RetryOutcome},
};

/// Boxed future alias used throughout the storage traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations the durable queue backend must provide.
pub trait QueueStore: Send + Sync + 'static {
    /// Durably persists an event before the HTTP caller is answered.
    ///
    /// Deduplicates on the idempotency key: a key that is already pending,
    /// in-flight, or recently delivered yields [`Enqueue::Duplicate`].
    fn enqueue<'a>(
        &'a self,
        event: &'a CanonicalEvent,
        tenant_id: TenantId,
    ) -> BoxFuture<'a, Result<Enqueue>>;

    /// Atomically leases the oldest due event, if any.
    ///
    /// The lease is a backend-side `SET NX` with expiry, not an in-process
    /// lock; a crashed claimant's lease simply times out.
    fn claim_next<'a>(
        &'a self,
        owner: &'a OwnerToken,
    ) -> BoxFuture<'a, Result<Option<PendingEvent>>>;

    /// Removes a record after successful end-to-end delivery and writes a
    /// short-lived delivered marker used to dedupe recovery.
    fn ack<'a>(&'a self, queue_key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Drops the lease without acknowledging, making the event immediately
    /// claimable again. Used when a worker times out mid-processing.
    fn release<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
    ) -> BoxFuture<'a, Result<()>>;

    /// Records a failed attempt and either reschedules with backoff or
    /// moves the event to the dead-letter area.
    fn retry<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
        error: &'a str,
    ) -> BoxFuture<'a, Result<RetryOutcome>>;

    /// Moves an event straight to the dead-letter area, bypassing backoff.
    /// Used for non-retryable failures such as missing credentials.
    fn dead_letter<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
        error: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Startup-only scan re-driving events abandoned by dead workers.
    ///
    /// Returns how many events were made claimable again. Idempotent:
    /// already-delivered keys are cleaned up without re-notifying, and a
    /// second pass finds nothing new.
    fn recover_orphaned(&self) -> BoxFuture<'_, Result<usize>>;

    /// Lists dead-lettered events for operator inspection.
    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DeadLetter>>>;

    /// Requeues a dead-lettered event for a fresh round of attempts.
    ///
    /// Returns `false` when no dead letter exists under the key.
    fn replay_dead_letter<'a>(&'a self, queue_key: &'a str) -> BoxFuture<'a, Result<bool>>;
}
