//! Pipeline workers: claim, enrich, format, deliver, ack.

use std::{sync::Arc, time::Duration};

use notiq_core::{CanonicalEvent, Clock, EventKind, Provider, TenantId};
use notiq_enrich::{Blender, EnrichedCompany, EnrichedPerson};
use notiq_notify::{
    DeliveryClient, DeliveryError, DeliveryOptions, DestinationCredentials, DestinationFormatter,
    EntityType, NotificationBuilder, ThreadRef, ThreadStore,
};
use notiq_queue::{OwnerToken, PendingEvent, QueueStore, RetryOutcome};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    records::{CrossReference, RecordStore},
    Result,
};

/// Destination for a tenant's notifications.
#[derive(Debug, Clone)]
pub struct NotifyTarget {
    /// Webhook credentials, never logged in full.
    pub credentials: DestinationCredentials,
    /// Channel override forwarded with every delivery.
    pub channel: Option<String>,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of concurrent pipeline workers.
    pub worker_count: usize,
    /// How long an idle worker waits before polling the queue again.
    pub poll_interval: Duration,
    /// Budget for each enrichment blend call.
    pub enrich_timeout: Duration,
    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            enrich_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for pipeline monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Workers currently running.
    pub active_workers: usize,
    /// Events claimed and processed (any outcome).
    pub events_processed: u64,
    /// Successful end-to-end deliveries.
    pub delivered: u64,
    /// Failed attempts rescheduled with backoff.
    pub retried: u64,
    /// Events moved to the dead-letter area.
    pub dead_lettered: u64,
    /// Leases released after a delivery timeout.
    pub released: u64,
}

/// Outcome of processing one claimed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Delivered and acknowledged.
    Delivered,
    /// Failed; rescheduled with backoff.
    Retried,
    /// Failed terminally; parked for operators.
    DeadLettered,
    /// Delivery timed out; lease released for another worker.
    Released,
}

/// Everything a worker needs to process one event end to end.
pub struct Pipeline {
    queue: Arc<dyn QueueStore>,
    blender: Arc<Blender>,
    formatter: Arc<dyn DestinationFormatter>,
    threads: Arc<dyn ThreadStore>,
    client: DeliveryClient,
    records: Arc<dyn RecordStore>,
    target: NotifyTarget,
    builder: NotificationBuilder,
    enrich_timeout: Duration,
}

impl Pipeline {
    /// Assembles the pipeline from its injected collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueStore>,
        blender: Arc<Blender>,
        formatter: Arc<dyn DestinationFormatter>,
        threads: Arc<dyn ThreadStore>,
        client: DeliveryClient,
        records: Arc<dyn RecordStore>,
        target: NotifyTarget,
        enrich_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            blender,
            formatter,
            threads,
            client,
            records,
            target,
            builder: NotificationBuilder::new(),
            enrich_timeout,
        }
    }

    /// The queue this pipeline drains.
    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }

    /// Processes one claimed event end to end.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::Queue`] when the queue backend itself
    /// fails; delivery and enrichment failures are handled internally.
    pub async fn process(
        &self,
        pending: &PendingEvent,
        owner: &OwnerToken,
    ) -> Result<ProcessOutcome> {
        let event = &pending.event;

        let company = self.enrich_company(event).await;
        let person = self.enrich_person(event, pending.tenant_id).await;

        let notification = self.builder.build(event, company.as_ref(), person.as_ref());
        let payload = self.formatter.format(&notification);

        let (entity_type, entity_id) = thread_entity(event);
        let existing = self.resolve_thread(pending.tenant_id, entity_type, &entity_id).await;

        let options = DeliveryOptions {
            channel: self.target.channel.clone(),
            thread_ref: existing.as_ref().map(|t| t.thread_ts.clone()),
        };

        match self.client.send(&payload, &self.target.credentials, &options).await {
            Ok(receipt) => {
                self.queue.ack(&pending.queue_key).await?;
                info!(
                    queue_key = %pending.queue_key,
                    kind = %event.kind,
                    status = receipt.status_code,
                    "notification delivered"
                );

                if existing.is_none() {
                    self.store_thread(pending.tenant_id, entity_type, &entity_id, &receipt.message_ts)
                        .await;
                }
                self.post_delivery(event).await;

                Ok(ProcessOutcome::Delivered)
            },
            Err(DeliveryError::Timeout { timeout_seconds }) => {
                // A stuck destination must not occupy the worker; drop the
                // lease so recovery or another worker retries later.
                warn!(
                    queue_key = %pending.queue_key,
                    timeout_seconds,
                    "delivery timed out, releasing lease"
                );
                self.queue.release(&pending.queue_key, owner).await?;
                Ok(ProcessOutcome::Released)
            },
            Err(e) if e.is_retryable() => {
                warn!(queue_key = %pending.queue_key, error = %e, "delivery failed");
                match self.queue.retry(&pending.queue_key, owner, &e.to_string()).await? {
                    RetryOutcome::Scheduled { next_attempt_at, attempt_count } => {
                        debug!(
                            queue_key = %pending.queue_key,
                            attempt_count,
                            next_retry_at = %next_attempt_at,
                            "retry scheduled"
                        );
                        Ok(ProcessOutcome::Retried)
                    },
                    RetryOutcome::DeadLettered => Ok(ProcessOutcome::DeadLettered),
                }
            },
            Err(e) => {
                error!(
                    queue_key = %pending.queue_key,
                    error = %e,
                    "delivery failed terminally, dead-lettering"
                );
                self.queue.dead_letter(&pending.queue_key, owner, &e.to_string()).await?;
                Ok(ProcessOutcome::DeadLettered)
            },
        }
    }

    /// Company enrichment with a timeout; every failure degrades to `None`.
    async fn enrich_company(&self, event: &CanonicalEvent) -> Option<EnrichedCompany> {
        let domain = event.customer.enrichment_domain()?;
        match tokio::time::timeout(self.enrich_timeout, self.blender.blend_company(&domain)).await {
            Ok(Ok(company)) => company,
            Ok(Err(e)) => {
                warn!(domain = %domain, error = %e, "company enrichment failed");
                None
            },
            Err(_) => {
                warn!(domain = %domain, "company enrichment timed out");
                None
            },
        }
    }

    /// Person enrichment with a timeout; every failure degrades to `None`.
    async fn enrich_person(
        &self,
        event: &CanonicalEvent,
        tenant: TenantId,
    ) -> Option<EnrichedPerson> {
        if event.customer.email.is_empty() {
            return None;
        }
        match tokio::time::timeout(
            self.enrich_timeout,
            self.blender.blend_person(&event.customer.email, tenant),
        )
        .await
        {
            Ok(Ok(person)) => person,
            Ok(Err(e)) => {
                warn!(error = %e, "person enrichment failed");
                None
            },
            Err(_) => {
                warn!("person enrichment timed out");
                None
            },
        }
    }

    /// Thread lookup; a broken thread store degrades to a fresh message.
    async fn resolve_thread(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Option<ThreadRef> {
        match self.threads.resolve(tenant, entity_type, entity_id).await {
            Ok(thread) => thread,
            Err(e) => {
                warn!(error = %e, "thread lookup failed, sending unthreaded");
                None
            },
        }
    }

    /// Seeds the thread mapping from a fresh delivery's message timestamp.
    async fn store_thread(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        message_ts: &Option<String>,
    ) {
        let Some(ts) = message_ts else {
            return;
        };
        let thread = ThreadRef {
            channel_id: self.target.channel.clone().unwrap_or_default(),
            thread_ts: ts.clone(),
        };
        if let Err(e) = self.threads.get_or_create(tenant, entity_type, entity_id, thread).await {
            warn!(error = %e, "failed to store thread mapping");
        }
    }

    /// Fire-and-forget record writes after a successful delivery.
    async fn post_delivery(&self, event: &CanonicalEvent) {
        match event.kind {
            EventKind::PaymentSuccess | EventKind::PaymentFailure => {
                self.records.save_payment_record(event).await;
            },
            _ => {},
        }
        if event.provider == Provider::Shopify && event.metadata("order_number").is_some() {
            self.records.save_order_record(event).await;
        }

        if event.provider == Provider::Chargify {
            if let Some(order_ref) = event.metadata("shopify_order_ref") {
                let source_ref = event
                    .metadata("transaction_id")
                    .unwrap_or(event.external_id.as_str())
                    .to_string();
                self.records
                    .log_cross_reference(CrossReference {
                        source_platform: Provider::Chargify.as_str().to_string(),
                        source_ref,
                        target_platform: Provider::Shopify.as_str().to_string(),
                        target_ref: Some(order_ref.to_string()),
                        success: true,
                        error: None,
                    })
                    .await;
            }
        }
    }
}

/// Derives the thread-continuity entity for an event.
///
/// Subscriptions thread by subscription, orders by order number, anything
/// else by provider customer, so repeated updates to the same underlying
/// entity land in one conversation.
pub fn thread_entity(event: &CanonicalEvent) -> (EntityType, String) {
    if let Some(sub) = &event.subscription {
        if !sub.id.is_empty() {
            return (EntityType::Subscription, sub.id.clone());
        }
    }
    if let Some(order) = event.metadata("order_number") {
        return (EntityType::Order, order.to_string());
    }
    (EntityType::Customer, event.customer.external_customer_id.clone())
}

/// One worker in the pool.
pub struct PipelineWorker {
    id: usize,
    pipeline: Arc<Pipeline>,
    config: PipelineConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation: CancellationToken,
    clock: Arc<dyn Clock>,
    owner: OwnerToken,
}

impl PipelineWorker {
    /// Creates a worker with its own owner token.
    pub fn new(
        id: usize,
        pipeline: Arc<Pipeline>,
        config: PipelineConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, pipeline, config, stats, cancellation, clock, owner: OwnerToken::new() }
    }

    /// Main worker loop: claim and process until cancelled.
    ///
    /// # Errors
    ///
    /// Never returns an error today; failures are logged and retried with a
    /// pause to avoid tight error loops.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "pipeline worker starting");

        loop {
            if self.cancellation.is_cancelled() {
                break;
            }

            match self.step().await {
                Ok(true) => {},
                Ok(false) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation.cancelled() => break,
                    }
                },
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "worker step failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "pipeline worker stopped");
        Ok(())
    }

    /// Claims and processes at most one event.
    ///
    /// Returns `true` when an event was claimed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::Queue`] when the queue backend fails.
    pub async fn step(&self) -> Result<bool> {
        let Some(pending) = self.pipeline.queue.claim_next(&self.owner).await? else {
            return Ok(false);
        };

        let outcome = self.pipeline.process(&pending, &self.owner).await?;

        let mut stats = self.stats.write().await;
        stats.events_processed += 1;
        match outcome {
            ProcessOutcome::Delivered => stats.delivered += 1,
            ProcessOutcome::Retried => stats.retried += 1,
            ProcessOutcome::DeadLettered => stats.dead_lettered += 1,
            ProcessOutcome::Released => stats.released += 1,
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use notiq_core::{Amount, CustomerData, PlanTier, SubscriptionData, TestClock};
    use notiq_enrich::{EnrichmentRegistry, MemoryCacheStore, StaticTenantDirectory};
    use notiq_notify::{MemoryThreadStore, SlackFormatter};
    use notiq_queue::{Enqueue, MemoryQueueStore, RetryPolicy};
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::records::TracingRecordStore;

    use super::*;

    struct TestRig {
        pipeline: Arc<Pipeline>,
        queue: Arc<MemoryQueueStore>,
        threads: Arc<MemoryThreadStore>,
        tenant: TenantId,
        owner: OwnerToken,
        clock: TestClock,
        _server: MockServer,
    }

    impl TestRig {
        /// Advances the shared queue clock so rescheduled events come due.
        fn advance(&self, duration: Duration) {
            self.clock.advance(duration);
        }
    }

    async fn rig_with_response(template: ResponseTemplate) -> TestRig {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/hook")).respond_with(template).mount(&server).await;

        let clock = TestClock::new();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(MemoryQueueStore::new(
            clock_arc.clone(),
            RetryPolicy { jitter_factor: 0.0, max_attempts: 3, ..Default::default() },
        ));
        let threads = Arc::new(MemoryThreadStore::new());
        let tenant = TenantId::new();

        let blender = Arc::new(Blender::new(
            Arc::new(EnrichmentRegistry::new()),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(StaticTenantDirectory::new(tenant, PlanTier::Free)),
            clock_arc,
        ));

        let pipeline = Arc::new(Pipeline::new(
            queue.clone(),
            blender,
            Arc::new(SlackFormatter::new()),
            threads.clone(),
            DeliveryClient::new(Duration::from_secs(2)).expect("client"),
            Arc::new(TracingRecordStore::new()),
            NotifyTarget {
                credentials: DestinationCredentials::new(format!("{}/hook", server.uri())),
                channel: Some("C123".to_string()),
            },
            Duration::from_secs(2),
        ));

        TestRig {
            pipeline,
            queue,
            threads,
            tenant,
            owner: OwnerToken::new(),
            clock,
            _server: server,
        }
    }

    fn renewal_event(external_id: &str) -> CanonicalEvent {
        CanonicalEvent {
            provider: Provider::Chargify,
            kind: EventKind::PaymentSuccess,
            customer: CustomerData {
                external_customer_id: "cus_1".into(),
                email: "jane@gmail.com".into(),
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                company_name: "Acme".into(),
                company_domain: None,
            },
            subscription: Some(SubscriptionData {
                id: "sub_42".into(),
                status: "active".into(),
                plan_name: "Scale Plan".into(),
                cancel_at_period_end: false,
                previous_status: None,
            }),
            amount: Amount::Cents(2999),
            currency: "USD".into(),
            external_id: external_id.into(),
            occurred_at: Utc::now(),
            raw_metadata: BTreeMap::new(),
        }
    }

    async fn claim(rig: &TestRig) -> PendingEvent {
        rig.queue.claim_next(&rig.owner).await.unwrap().expect("event claimable")
    }

    #[tokio::test]
    async fn end_to_end_delivery_formats_amount() {
        let rig =
            rig_with_response(ResponseTemplate::new(200).set_body_json(json!({"ts": "111.222"})))
                .await;

        rig.queue.enqueue(&renewal_event("evt_1"), rig.tenant).await.unwrap();
        let pending = claim(&rig).await;
        let outcome = rig.pipeline.process(&pending, &rig.owner).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Delivered);
        assert!(rig.queue.is_empty(), "acked after delivery");

        let requests = rig._server.received_requests().await.expect("requests recorded");
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("29.99 USD"), "formatted amount present: {body}");
        assert!(body.contains("#28a745"), "success palette color present");
    }

    #[tokio::test]
    async fn unknown_amount_renders_sentinel_end_to_end() {
        let rig = rig_with_response(ResponseTemplate::new(200)).await;

        let mut event = renewal_event("evt_1");
        event.kind = EventKind::PaymentFailure;
        event.amount = Amount::Unknown;
        rig.queue.enqueue(&event, rig.tenant).await.unwrap();

        let pending = claim(&rig).await;
        let outcome = rig.pipeline.process(&pending, &rig.owner).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Delivered);

        let requests = rig._server.received_requests().await.expect("requests recorded");
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("unknown amount"));
        assert!(body.contains("#dc3545"), "failure palette color present");
    }

    #[tokio::test]
    async fn provider_retry_of_delivered_event_notifies_once() {
        let rig = rig_with_response(ResponseTemplate::new(200)).await;

        rig.queue.enqueue(&renewal_event("evt_1"), rig.tenant).await.unwrap();
        let pending = claim(&rig).await;
        rig.pipeline.process(&pending, &rig.owner).await.unwrap();

        // Provider retries the same webhook after we delivered.
        let second = rig.queue.enqueue(&renewal_event("evt_1"), rig.tenant).await.unwrap();
        assert!(matches!(second, Enqueue::Duplicate { .. }));
        assert!(rig.queue.claim_next(&rig.owner).await.unwrap().is_none());

        let requests = rig._server.received_requests().await.expect("requests recorded");
        assert_eq!(requests.len(), 1, "at most one delivered notification");
    }

    #[tokio::test]
    async fn follow_up_event_replies_in_thread() {
        let rig =
            rig_with_response(ResponseTemplate::new(200).set_body_json(json!({"ts": "111.222"})))
                .await;

        rig.queue.enqueue(&renewal_event("evt_1"), rig.tenant).await.unwrap();
        let pending = claim(&rig).await;
        rig.pipeline.process(&pending, &rig.owner).await.unwrap();

        // Same subscription, new logical event.
        rig.queue.enqueue(&renewal_event("evt_2"), rig.tenant).await.unwrap();
        let pending = claim(&rig).await;
        rig.pipeline.process(&pending, &rig.owner).await.unwrap();

        let requests = rig._server.received_requests().await.expect("requests recorded");
        assert_eq!(requests.len(), 2);
        let first = String::from_utf8_lossy(&requests[0].body);
        let second = String::from_utf8_lossy(&requests[1].body);
        assert!(!first.contains("thread_ts"), "first message starts the thread");
        assert!(second.contains("\"thread_ts\":\"111.222\""), "follow-up threads: {second}");

        let mapping = rig
            .threads
            .resolve(rig.tenant, EntityType::Subscription, "sub_42")
            .await
            .unwrap()
            .expect("mapping stored");
        assert_eq!(mapping.thread_ts, "111.222");
    }

    #[tokio::test]
    async fn server_error_schedules_retry_then_dead_letters() {
        let rig = rig_with_response(ResponseTemplate::new(503).set_body_string("boom")).await;

        rig.queue.enqueue(&renewal_event("evt_1"), rig.tenant).await.unwrap();

        // max_attempts = 3 in the rig's policy.
        for _ in 0..2 {
            let pending = claim(&rig).await;
            let outcome = rig.pipeline.process(&pending, &rig.owner).await.unwrap();
            assert_eq!(outcome, ProcessOutcome::Retried);
            rig.advance(Duration::from_secs(600));
        }

        let pending = claim(&rig).await;
        let outcome = rig.pipeline.process(&pending, &rig.owner).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::DeadLettered);

        let letters = rig.queue.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("503"));
    }

    #[tokio::test]
    async fn timeout_releases_lease_for_another_worker() {
        let rig = rig_with_response(
            ResponseTemplate::new(200).set_delay(Duration::from_secs(10)),
        )
        .await;

        rig.queue.enqueue(&renewal_event("evt_1"), rig.tenant).await.unwrap();
        let pending = claim(&rig).await;
        let outcome = rig.pipeline.process(&pending, &rig.owner).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Released);

        // The event is immediately claimable by another worker; no attempt
        // was consumed.
        let other = OwnerToken::new();
        let reclaimed = rig.queue.claim_next(&other).await.unwrap().expect("reclaimable");
        assert_eq!(reclaimed.attempt_count, 0);
    }
}
