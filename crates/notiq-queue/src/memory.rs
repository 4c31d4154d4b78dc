//! In-memory queue backend for tests.
//!
//! Mirrors the Redis backend's semantics (lease expiry, delivered markers,
//! orphan-age checks) against a mutex-guarded map so queue and pipeline
//! behavior can be verified deterministically with a [`TestClock`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use notiq_core::{CanonicalEvent, Clock, TenantId};
use tracing::debug;

use crate::{
    error::{QueueError, Result},
    pending::{DeadLetter, Enqueue, OwnerToken, PendingEvent, RetryOutcome},
    policy::{RetryDecision, RetryPolicy},
    store::{BoxFuture, QueueStore},
};

#[cfg(test)]
use notiq_core::TestClock;

#[derive(Debug, Default)]
struct Inner {
    /// Persisted records by queue key.
    events: HashMap<String, PendingEvent>,
    /// Due time per queue key; absence means the event is in-flight.
    ready: HashMap<String, DateTime<Utc>>,
    /// Active leases: owner token and expiry.
    leases: HashMap<String, (String, DateTime<Utc>)>,
    /// Delivered markers and their expiry.
    delivered: HashMap<String, DateTime<Utc>>,
    /// Dead-lettered events by queue key.
    dead: HashMap<String, DeadLetter>,
}

/// Test double for [`QueueStore`] with the same observable behavior as the
/// Redis implementation.
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    lease_ttl: Duration,
    orphan_min_age: Duration,
    delivered_ttl: Duration,
}

impl MemoryQueueStore {
    /// Creates a store with the given clock and retry policy.
    pub fn new(clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            policy,
            lease_ttl: Duration::from_secs(60),
            orphan_min_age: Duration::from_secs(35),
            delivered_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Overrides the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Overrides the minimum age before an event counts as orphaned.
    pub fn with_orphan_min_age(mut self, age: Duration) -> Self {
        self.orphan_min_age = age;
        self
    }

    /// Number of records currently persisted (pending or in-flight).
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Whether no records are persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; propagate the
        // inner state anyway since tests want to observe it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lease_live(inner: &Inner, queue_key: &str, now: DateTime<Utc>) -> bool {
        inner.leases.get(queue_key).is_some_and(|(_, expiry)| *expiry > now)
    }

    fn delivered_live(inner: &Inner, queue_key: &str, now: DateTime<Utc>) -> bool {
        inner.delivered.get(queue_key).is_some_and(|expiry| *expiry > now)
    }

    fn check_owner(inner: &Inner, queue_key: &str, owner: &OwnerToken, now: DateTime<Utc>) -> bool {
        inner
            .leases
            .get(queue_key)
            .is_some_and(|(holder, expiry)| holder == owner.as_str() && *expiry > now)
    }
}

impl QueueStore for MemoryQueueStore {
    fn enqueue<'a>(
        &'a self,
        event: &'a CanonicalEvent,
        tenant_id: TenantId,
    ) -> BoxFuture<'a, Result<Enqueue>> {
        Box::pin(async move {
            let queue_key = event.idempotency_key();
            let now = self.clock.now_utc();
            let mut inner = self.lock();

            if Self::delivered_live(&inner, &queue_key, now)
                || inner.events.contains_key(&queue_key)
            {
                return Ok(Enqueue::Duplicate { queue_key });
            }

            let pending = PendingEvent {
                queue_key: queue_key.clone(),
                tenant_id,
                event: event.clone(),
                enqueued_at: now,
                attempt_count: 0,
                last_error: None,
            };
            inner.events.insert(queue_key.clone(), pending);
            inner.ready.insert(queue_key.clone(), now);

            Ok(Enqueue::Enqueued { queue_key })
        })
    }

    fn claim_next<'a>(
        &'a self,
        owner: &'a OwnerToken,
    ) -> BoxFuture<'a, Result<Option<PendingEvent>>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut inner = self.lock();

            let candidate = inner
                .ready
                .iter()
                .filter(|(key, due)| **due <= now && !Self::lease_live(&inner, key, now))
                .min_by_key(|(_, due)| **due)
                .map(|(key, _)| key.clone());

            let Some(queue_key) = candidate else {
                return Ok(None);
            };

            let expiry = now
                + chrono::Duration::from_std(self.lease_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            inner.leases.insert(queue_key.clone(), (owner.as_str().to_string(), expiry));
            inner.ready.remove(&queue_key);

            match inner.events.get(&queue_key) {
                Some(pending) => Ok(Some(pending.clone())),
                None => {
                    // Record vanished between index and fetch; clean up.
                    inner.leases.remove(&queue_key);
                    Ok(None)
                },
            }
        })
    }

    fn ack<'a>(&'a self, queue_key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut inner = self.lock();
            inner.events.remove(queue_key);
            inner.ready.remove(queue_key);
            inner.leases.remove(queue_key);
            let expiry = now
                + chrono::Duration::from_std(self.delivered_ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
            inner.delivered.insert(queue_key.to_string(), expiry);
            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut inner = self.lock();
            if !Self::check_owner(&inner, queue_key, owner, now) {
                return Err(QueueError::LeaseNotHeld { queue_key: queue_key.to_string() });
            }
            inner.leases.remove(queue_key);
            if inner.events.contains_key(queue_key) {
                inner.ready.insert(queue_key.to_string(), now);
            }
            Ok(())
        })
    }

    fn retry<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
        error: &'a str,
    ) -> BoxFuture<'a, Result<RetryOutcome>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut inner = self.lock();
            if !Self::check_owner(&inner, queue_key, owner, now) {
                return Err(QueueError::LeaseNotHeld { queue_key: queue_key.to_string() });
            }

            let Some(mut pending) = inner.events.get(queue_key).cloned() else {
                return Err(QueueError::RecordNotFound { queue_key: queue_key.to_string() });
            };

            pending.attempt_count += 1;
            pending.last_error = Some(error.to_string());

            match self.policy.decide(pending.attempt_count) {
                RetryDecision::GiveUp => {
                    inner.events.remove(queue_key);
                    inner.ready.remove(queue_key);
                    inner.leases.remove(queue_key);
                    inner.dead.insert(queue_key.to_string(), DeadLetter {
                        pending,
                        error: error.to_string(),
                        failed_at: now,
                    });
                    Ok(RetryOutcome::DeadLettered)
                },
                RetryDecision::Retry { delay } => {
                    let next_attempt_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1));
                    let attempt_count = pending.attempt_count;
                    inner.events.insert(queue_key.to_string(), pending);
                    inner.ready.insert(queue_key.to_string(), next_attempt_at);
                    inner.leases.remove(queue_key);
                    Ok(RetryOutcome::Scheduled { next_attempt_at, attempt_count })
                },
            }
        })
    }

    fn dead_letter<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
        error: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut inner = self.lock();
            if !Self::check_owner(&inner, queue_key, owner, now) {
                return Err(QueueError::LeaseNotHeld { queue_key: queue_key.to_string() });
            }
            let Some(pending) = inner.events.remove(queue_key) else {
                return Err(QueueError::RecordNotFound { queue_key: queue_key.to_string() });
            };
            inner.ready.remove(queue_key);
            inner.leases.remove(queue_key);
            inner.dead.insert(queue_key.to_string(), DeadLetter {
                pending,
                error: error.to_string(),
                failed_at: now,
            });
            Ok(())
        })
    }

    fn recover_orphaned(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let min_age = chrono::Duration::from_std(self.orphan_min_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(35));
            let mut inner = self.lock();
            let mut recovered = 0;

            let keys: Vec<String> = inner.events.keys().cloned().collect();
            for queue_key in keys {
                if Self::delivered_live(&inner, &queue_key, now) {
                    // Delivered by a previous instance that died before ack
                    // cleanup finished; drop without re-notifying.
                    inner.events.remove(&queue_key);
                    inner.ready.remove(&queue_key);
                    continue;
                }
                if inner.ready.contains_key(&queue_key) {
                    continue;
                }
                if Self::lease_live(&inner, &queue_key, now) {
                    continue;
                }
                let Some(pending) = inner.events.get(&queue_key) else {
                    continue;
                };
                if now - pending.enqueued_at < min_age {
                    continue;
                }

                debug!(queue_key = %queue_key, "recovering orphaned event");
                inner.leases.remove(&queue_key);
                inner.ready.insert(queue_key, now);
                recovered += 1;
            }

            Ok(recovered)
        })
    }

    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DeadLetter>>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut letters: Vec<DeadLetter> = inner.dead.values().cloned().collect();
            letters.sort_by_key(|l| l.failed_at);
            letters.truncate(limit);
            Ok(letters)
        })
    }

    fn replay_dead_letter<'a>(&'a self, queue_key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut inner = self.lock();
            let Some(letter) = inner.dead.remove(queue_key) else {
                return Ok(false);
            };
            let mut pending = letter.pending;
            pending.attempt_count = 0;
            pending.last_error = None;
            inner.events.insert(queue_key.to_string(), pending);
            inner.ready.insert(queue_key.to_string(), now);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use notiq_core::{Amount, CustomerData, EventKind, Provider};

    use super::*;

    fn sample_event(external_id: &str) -> CanonicalEvent {
        CanonicalEvent {
            provider: Provider::Stripe,
            kind: EventKind::PaymentSuccess,
            customer: CustomerData {
                external_customer_id: "cus_1".into(),
                email: "jane@acme.io".into(),
                ..Default::default()
            },
            subscription: None,
            amount: Amount::Cents(2999),
            currency: "USD".into(),
            external_id: external_id.into(),
            occurred_at: Utc::now(),
            raw_metadata: BTreeMap::new(),
        }
    }

    fn store(clock: &TestClock) -> MemoryQueueStore {
        MemoryQueueStore::new(
            Arc::new(clock.clone()),
            RetryPolicy { jitter_factor: 0.0, ..Default::default() },
        )
        .with_lease_ttl(Duration::from_secs(60))
        .with_orphan_min_age(Duration::from_secs(35))
    }

    #[tokio::test]
    async fn enqueue_then_claim_returns_event_once() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        let outcome = store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        assert!(matches!(outcome, Enqueue::Enqueued { .. }));

        let claimed = store.claim_next(&owner).await.unwrap().expect("event claimable");
        assert_eq!(claimed.queue_key, "stripe:evt_1");

        // While the lease is live no other worker can claim it.
        let other = OwnerToken::new();
        assert!(store.claim_next(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let clock = TestClock::new();
        let store = store(&clock);

        let first = store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        let second = store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        assert!(matches!(first, Enqueue::Enqueued { .. }));
        assert!(matches!(second, Enqueue::Duplicate { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_delivery_is_duplicate() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        let claimed = store.claim_next(&owner).await.unwrap().expect("claim");
        store.ack(&claimed.queue_key).await.unwrap();

        // Provider retries the same webhook after we already delivered.
        let retry = store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        assert!(matches!(retry, Enqueue::Duplicate { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        store.claim_next(&owner).await.unwrap().expect("claim");

        // Lease expires but the event never returned to the ready set, so
        // only recovery can re-drive it.
        clock.advance(Duration::from_secs(120));
        let other = OwnerToken::new();
        assert!(store.claim_next(&other).await.unwrap().is_none());

        let recovered = store.recover_orphaned().await.unwrap();
        assert_eq!(recovered, 1);
        let reclaimed = store.claim_next(&other).await.unwrap().expect("reclaim");
        assert_eq!(reclaimed.queue_key, "stripe:evt_1");
    }

    #[tokio::test]
    async fn second_recovery_pass_is_noop() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        store.claim_next(&owner).await.unwrap().expect("claim");
        clock.advance(Duration::from_secs(120));

        assert_eq!(store.recover_orphaned().await.unwrap(), 1);
        assert_eq!(store.recover_orphaned().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recovery_drops_already_delivered_events() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        let claimed = store.claim_next(&owner).await.unwrap().expect("claim");
        store.ack(&claimed.queue_key).await.unwrap();

        // Simulate a crashed instance leaving a stale record behind by
        // re-inserting the event without clearing the delivered marker.
        {
            let mut inner = store.lock();
            inner.events.insert(claimed.queue_key.clone(), claimed.clone());
        }
        clock.advance(Duration::from_secs(120));

        assert_eq!(store.recover_orphaned().await.unwrap(), 0);
        assert!(store.is_empty(), "delivered event must not be re-driven");
    }

    #[tokio::test]
    async fn fresh_events_are_not_recovered() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        store.claim_next(&owner).await.unwrap().expect("claim");

        // Lease gone but the event is younger than the orphan minimum age.
        {
            let mut inner = store.lock();
            inner.leases.clear();
        }
        assert_eq!(store.recover_orphaned().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_schedules_with_backoff_then_dead_letters() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();

        for attempt in 1..8 {
            let claimed = store.claim_next(&owner).await.unwrap().expect("claim");
            let outcome = store.retry(&claimed.queue_key, &owner, "delivery timeout").await.unwrap();
            match outcome {
                RetryOutcome::Scheduled { attempt_count, .. } => {
                    assert_eq!(attempt_count, attempt);
                },
                RetryOutcome::DeadLettered => panic!("dead-lettered too early"),
            }
            clock.advance(Duration::from_secs(600));
        }

        let claimed = store.claim_next(&owner).await.unwrap().expect("claim");
        let outcome = store.retry(&claimed.queue_key, &owner, "delivery timeout").await.unwrap();
        assert_eq!(outcome, RetryOutcome::DeadLettered);

        let letters = store.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].pending.attempt_count, 8);
        assert_eq!(letters[0].error, "delivery timeout");
    }

    #[tokio::test]
    async fn release_makes_event_claimable_again() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        let claimed = store.claim_next(&owner).await.unwrap().expect("claim");
        store.release(&claimed.queue_key, &owner).await.unwrap();

        let other = OwnerToken::new();
        let reclaimed = store.claim_next(&other).await.unwrap().expect("reclaim");
        assert_eq!(reclaimed.attempt_count, 0, "release must not count as an attempt");
    }

    #[tokio::test]
    async fn retry_without_lease_is_rejected() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        let err = store.retry("stripe:evt_1", &owner, "boom").await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseNotHeld { .. }));
    }

    #[tokio::test]
    async fn replay_dead_letter_requeues_fresh() {
        let clock = TestClock::new();
        let store = store(&clock);
        let owner = OwnerToken::new();

        store.enqueue(&sample_event("evt_1"), TenantId::new()).await.unwrap();
        let claimed = store.claim_next(&owner).await.unwrap().expect("claim");
        store.dead_letter(&claimed.queue_key, &owner, "missing credential").await.unwrap();
        assert!(store.is_empty());

        assert!(store.replay_dead_letter("stripe:evt_1").await.unwrap());
        assert!(!store.replay_dead_letter("stripe:evt_1").await.unwrap());

        let replayed = store.claim_next(&owner).await.unwrap().expect("claim replayed");
        assert_eq!(replayed.attempt_count, 0);
    }
}
