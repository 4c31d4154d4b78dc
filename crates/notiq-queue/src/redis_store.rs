//! Redis implementation of the durable queue.
//!
//! Key layout (all under the `nq:` prefix):
//!
//! - `nq:event:{key}`: serialized [`PendingEvent`], present from enqueue
//!   until ack or dead-letter.
//! - `nq:ready`: sorted set of due queue keys, scored by due time millis.
//! - `nq:lease:{key}`: owner token with TTL; `SET NX EX` is the claim.
//! - `nq:done:{key}`: delivered marker with 24h TTL, dedupes recovery.
//! - `nq:dead`: hash of dead-lettered events by queue key.
//!
//! Claiming removes the key from the ready set, so an event abandoned by a
//! crashed worker exists only as a record plus an expiring lease; the
//! startup recovery scan is what re-drives it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use notiq_core::{CanonicalEvent, Clock, TenantId};
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, info, warn};

use crate::{
    error::{QueueError, Result},
    pending::{DeadLetter, Enqueue, OwnerToken, PendingEvent, RetryOutcome},
    policy::{RetryDecision, RetryPolicy},
    store::{BoxFuture, QueueStore},
};

const READY_KEY: &str = "nq:ready";
const DEAD_KEY: &str = "nq:dead";
const EVENT_PREFIX: &str = "nq:event:";
const LEASE_PREFIX: &str = "nq:lease:";
const DONE_PREFIX: &str = "nq:done:";

/// How many due candidates one claim call inspects before giving up.
const CLAIM_SCAN_LIMIT: usize = 16;

/// TTL for the delivered marker used to dedupe recovery.
const DELIVERED_TTL_SECS: u64 = 24 * 60 * 60;

fn event_key(queue_key: &str) -> String {
    format!("{EVENT_PREFIX}{queue_key}")
}

fn lease_key(queue_key: &str) -> String {
    format!("{LEASE_PREFIX}{queue_key}")
}

fn done_key(queue_key: &str) -> String {
    format!("{DONE_PREFIX}{queue_key}")
}

/// Production queue backend on Redis.
pub struct RedisQueueStore {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    lease_ttl: Duration,
    orphan_min_age: Duration,
}

impl RedisQueueStore {
    /// Creates the store over an established connection manager.
    pub fn new(conn: ConnectionManager, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            conn,
            clock,
            policy,
            lease_ttl: Duration::from_secs(60),
            orphan_min_age: Duration::from_secs(35),
        }
    }

    /// Overrides the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Overrides the minimum age before an unleased event counts as
    /// orphaned. Guards recovery against racing a just-received enqueue.
    pub fn with_orphan_min_age(mut self, age: Duration) -> Self {
        self.orphan_min_age = age;
        self
    }

    /// Atomic claim: `SET NX EX` on the lease key.
    async fn try_acquire_lease(&self, queue_key: &str, owner: &OwnerToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let response: Option<String> = redis::cmd("SET")
            .arg(lease_key(queue_key))
            .arg(owner.as_str())
            .arg("NX")
            .arg("EX")
            .arg(self.lease_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(response.is_some())
    }

    /// Whether `owner` currently holds the lease on `queue_key`.
    async fn holds_lease(&self, queue_key: &str, owner: &OwnerToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(lease_key(queue_key)).await?;
        Ok(holder.as_deref() == Some(owner.as_str()))
    }

    async fn load_pending(&self, queue_key: &str) -> Result<Option<PendingEvent>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(event_key(queue_key)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from)).transpose()
    }

    async fn store_pending(&self, pending: &PendingEvent) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(pending)?;
        let _: () = conn.set(event_key(&pending.queue_key), json).await?;
        Ok(())
    }

    async fn move_to_dead(&self, pending: PendingEvent, error: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let queue_key = pending.queue_key.clone();
        let letter =
            DeadLetter { pending, error: error.to_string(), failed_at: self.clock.now_utc() };
        let json = serde_json::to_string(&letter)?;

        let _: () = conn.hset(DEAD_KEY, &queue_key, json).await?;
        let _: () = conn.del(event_key(&queue_key)).await?;
        let _: () = conn.zrem(READY_KEY, &queue_key).await?;
        let _: () = conn.del(lease_key(&queue_key)).await?;
        Ok(())
    }

    async fn schedule(&self, queue_key: &str, due_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(READY_KEY, queue_key, due_at.timestamp_millis()).await?;
        Ok(())
    }
}

impl QueueStore for RedisQueueStore {
    fn enqueue<'a>(
        &'a self,
        event: &'a CanonicalEvent,
        tenant_id: TenantId,
    ) -> BoxFuture<'a, Result<Enqueue>> {
        Box::pin(async move {
            let queue_key = event.idempotency_key();
            let mut conn = self.conn.clone();

            let delivered: bool = conn.exists(done_key(&queue_key)).await?;
            if delivered {
                debug!(queue_key = %queue_key, "duplicate of recently delivered event");
                return Ok(Enqueue::Duplicate { queue_key });
            }

            let now = self.clock.now_utc();
            let pending = PendingEvent {
                queue_key: queue_key.clone(),
                tenant_id,
                event: event.clone(),
                enqueued_at: now,
                attempt_count: 0,
                last_error: None,
            };
            let json = serde_json::to_string(&pending)?;

            // NX: a pending or in-flight record under the same key wins.
            let created: Option<String> = redis::cmd("SET")
                .arg(event_key(&queue_key))
                .arg(json)
                .arg("NX")
                .query_async(&mut conn)
                .await?;
            if created.is_none() {
                debug!(queue_key = %queue_key, "duplicate of pending event");
                return Ok(Enqueue::Duplicate { queue_key });
            }

            self.schedule(&queue_key, now).await?;
            debug!(queue_key = %queue_key, "event enqueued");
            Ok(Enqueue::Enqueued { queue_key })
        })
    }

    fn claim_next<'a>(
        &'a self,
        owner: &'a OwnerToken,
    ) -> BoxFuture<'a, Result<Option<PendingEvent>>> {
        Box::pin(async move {
            let now = self.clock.now_utc().timestamp_millis();
            let mut conn = self.conn.clone();

            let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(READY_KEY)
                .arg("-inf")
                .arg(now)
                .arg("LIMIT")
                .arg(0)
                .arg(CLAIM_SCAN_LIMIT)
                .query_async(&mut conn)
                .await?;

            for queue_key in candidates {
                if !self.try_acquire_lease(&queue_key, owner).await? {
                    continue;
                }

                let _: () = conn.zrem(READY_KEY, &queue_key).await?;

                match self.load_pending(&queue_key).await? {
                    Some(pending) => {
                        debug!(queue_key = %queue_key, owner = %owner, "claimed event");
                        return Ok(Some(pending));
                    },
                    None => {
                        // Record acked between index read and fetch.
                        let _: () = conn.del(lease_key(&queue_key)).await?;
                    },
                }
            }

            Ok(None)
        })
    }

    fn ack<'a>(&'a self, queue_key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = conn.del(event_key(queue_key)).await?;
            let _: () = conn.zrem(READY_KEY, queue_key).await?;
            let _: () = conn.del(lease_key(queue_key)).await?;
            let _: () = conn.set_ex(done_key(queue_key), "1", DELIVERED_TTL_SECS).await?;
            debug!(queue_key = %queue_key, "event acknowledged");
            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        queue_key: &'a str,
        owner: &'a OwnerToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.holds_lease(queue_key, owner).await? {
                return Err(QueueError::LeaseNotHeld { queue_key: queue_key.to_string() });
            }
            let mut conn = self.conn.clone();
            let _: () = conn.del(lease_key(queue_key)).await?;
            if self.load_pending(queue_key).await?.is_some() {
                self.schedule(queue_key, self.clock.now_utc()).await?;
            }
            debug!(queue_key = %queue_key, "lease released without ack");
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
            if !self.holds_lease(queue_key, owner).await? {
                return Err(QueueError::LeaseNotHeld { queue_key: queue_key.to_string() });
            }

            let Some(mut pending) = self.load_pending(queue_key).await? else {
                return Err(QueueError::RecordNotFound { queue_key: queue_key.to_string() });
            };

            pending.attempt_count += 1;
            pending.last_error = Some(error.to_string());

            match self.policy.decide(pending.attempt_count) {
                RetryDecision::GiveUp => {
                    warn!(
                        queue_key = %queue_key,
                        attempts = pending.attempt_count,
                        error = %error,
                        "retry ceiling reached, dead-lettering event"
                    );
                    self.move_to_dead(pending, error).await?;
                    Ok(RetryOutcome::DeadLettered)
                },
                RetryDecision::Retry { delay } => {
                    let next_attempt_at = self.clock.now_utc()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1));
                    let attempt_count = pending.attempt_count;

                    self.store_pending(&pending).await?;
                    self.schedule(queue_key, next_attempt_at).await?;
                    let mut conn = self.conn.clone();
                    let _: () = conn.del(lease_key(queue_key)).await?;

                    debug!(
                        queue_key = %queue_key,
                        attempt_count,
                        next_retry_at = %next_attempt_at,
                        "retry scheduled"
                    );
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
            if !self.holds_lease(queue_key, owner).await? {
                return Err(QueueError::LeaseNotHeld { queue_key: queue_key.to_string() });
            }
            let Some(pending) = self.load_pending(queue_key).await? else {
                return Err(QueueError::RecordNotFound { queue_key: queue_key.to_string() });
            };
            warn!(queue_key = %queue_key, error = %error, "dead-lettering event");
            self.move_to_dead(pending, error).await
        })
    }

    fn recover_orphaned(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();

            let keys: Vec<String> = {
                let mut iter = conn.scan_match::<_, String>(format!("{EVENT_PREFIX}*")).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                keys
            };

            let now = self.clock.now_utc();
            let min_age = chrono::Duration::from_std(self.orphan_min_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(35));
            let mut recovered = 0;

            for full_key in keys {
                let Some(queue_key) = full_key.strip_prefix(EVENT_PREFIX) else {
                    continue;
                };

                let delivered: bool = conn.exists(done_key(queue_key)).await?;
                if delivered {
                    // A previous instance delivered but died before cleanup.
                    let _: () = conn.del(&full_key).await?;
                    let _: () = conn.zrem(READY_KEY, queue_key).await?;
                    debug!(queue_key = %queue_key, "dropped already-delivered orphan");
                    continue;
                }

                let queued: Option<f64> = conn.zscore(READY_KEY, queue_key).await?;
                if queued.is_some() {
                    continue;
                }

                let leased: bool = conn.exists(lease_key(queue_key)).await?;
                if leased {
                    continue;
                }

                let Some(pending) = self.load_pending(queue_key).await? else {
                    continue;
                };
                if now - pending.enqueued_at < min_age {
                    continue;
                }

                self.schedule(queue_key, now).await?;
                info!(
                    queue_key = %queue_key,
                    attempt_count = pending.attempt_count,
                    "recovered orphaned event"
                );
                recovered += 1;
            }

            if recovered > 0 {
                info!(recovered, "orphan recovery completed");
            }
            Ok(recovered)
        })
    }

    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DeadLetter>>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let entries: std::collections::HashMap<String, String> =
                conn.hgetall(DEAD_KEY).await?;

            let mut letters = Vec::with_capacity(entries.len().min(limit));
            for (queue_key, json) in entries {
                match serde_json::from_str::<DeadLetter>(&json) {
                    Ok(letter) => letters.push(letter),
                    Err(e) => warn!(queue_key = %queue_key, error = %e, "corrupt dead letter"),
                }
            }
            letters.sort_by_key(|l| l.failed_at);
            letters.truncate(limit);
            Ok(letters)
        })
    }

    fn replay_dead_letter<'a>(&'a self, queue_key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.hget(DEAD_KEY, queue_key).await?;
            let Some(json) = raw else {
                return Ok(false);
            };

            let letter: DeadLetter = serde_json::from_str(&json)?;
            let mut pending = letter.pending;
            pending.attempt_count = 0;
            pending.last_error = None;

            self.store_pending(&pending).await?;
            self.schedule(queue_key, self.clock.now_utc()).await?;
            let _: () = conn.hdel(DEAD_KEY, queue_key).await?;

            info!(queue_key = %queue_key, "dead letter requeued for replay");
            Ok(true)
        })
    }
}
