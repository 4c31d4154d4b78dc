//! Worker pool lifecycle management.
//!
//! Spawns supervised pipeline workers under a shared cancellation token and
//! shuts them down gracefully within a bounded timeout. Startup recovery is
//! the caller's job and must complete before the pool starts, so recovered
//! and fresh events cannot race for the same key.

use std::{sync::Arc, time::Duration};

use notiq_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    worker::{EngineStats, Pipeline, PipelineConfig, PipelineWorker},
    EngineError, Result,
};

/// Supervised pool of pipeline workers.
pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    config: PipelineConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation: CancellationToken,
    clock: Arc<dyn Clock>,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool; no workers run until [`WorkerPool::spawn_workers`].
    pub fn new(
        pipeline: Arc<Pipeline>,
        config: PipelineConfig,
        cancellation: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation,
            clock,
            worker_handles: Vec::new(),
        }
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Spawns all configured workers and returns immediately.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning pipeline workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = PipelineWorker::new(
                worker_id,
                self.pipeline.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "pipeline worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned = self.worker_handles.len(), "all pipeline workers spawned");
    }

    /// Signals cancellation and waits for in-flight work to finish.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] when workers do not finish
    /// within the configured grace period.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down worker pool"
        );

        self.cancellation.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let join_all = async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker finished with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                    },
                }
            }
            stats.write().await.active_workers = 0;
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, workers may still be running"
                );
                Err(EngineError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without graceful shutdown, cancelling workers"
            );
            self.cancellation.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use notiq_core::{
        Amount, CanonicalEvent, CustomerData, EventKind, PlanTier, Provider, TenantId, TestClock,
    };
    use notiq_enrich::{Blender, EnrichmentRegistry, MemoryCacheStore, StaticTenantDirectory};
    use notiq_notify::{
        DeliveryClient, DestinationCredentials, MemoryThreadStore, SlackFormatter,
    };
    use notiq_queue::{MemoryQueueStore, QueueStore, RetryPolicy};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{records::TracingRecordStore, worker::NotifyTarget};

    use super::*;

    async fn build_pool(server: &MockServer, queue: Arc<MemoryQueueStore>) -> WorkerPool {
        let clock = TestClock::new();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock);
        let tenant = TenantId::new();

        let blender = Arc::new(Blender::new(
            Arc::new(EnrichmentRegistry::new()),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(StaticTenantDirectory::new(tenant, PlanTier::Free)),
            clock_arc.clone(),
        ));

        let pipeline = Arc::new(Pipeline::new(
            queue,
            blender,
            Arc::new(SlackFormatter::new()),
            Arc::new(MemoryThreadStore::new()),
            DeliveryClient::new(Duration::from_secs(2)).expect("client"),
            Arc::new(TracingRecordStore::new()),
            NotifyTarget {
                credentials: DestinationCredentials::new(format!("{}/hook", server.uri())),
                channel: None,
            },
            Duration::from_secs(2),
        ));

        let config = PipelineConfig {
            worker_count: 3,
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        WorkerPool::new(pipeline, config, CancellationToken::new(), clock_arc)
    }

    fn sample_event(external_id: &str) -> CanonicalEvent {
        CanonicalEvent {
            provider: Provider::Stripe,
            kind: EventKind::PaymentSuccess,
            customer: CustomerData {
                external_customer_id: "cus_1".into(),
                email: String::new(),
                ..Default::default()
            },
            subscription: None,
            amount: Amount::Cents(500),
            currency: "USD".into(),
            external_id: external_id.into(),
            occurred_at: Utc::now(),
            raw_metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn pool_spawns_and_shuts_down_gracefully() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let queue = Arc::new(MemoryQueueStore::new(clock, RetryPolicy::default()));
        let mut pool = build_pool(&server, queue).await;

        assert!(!pool.has_active_workers());
        pool.spawn_workers().await;
        assert_eq!(pool.stats().await.active_workers, 3);

        pool.shutdown_graceful().await.expect("graceful shutdown");
    }

    #[tokio::test]
    async fn workers_drain_enqueued_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let queue = Arc::new(MemoryQueueStore::new(clock, RetryPolicy::default()));
        for i in 0..5 {
            queue.enqueue(&sample_event(&format!("evt_{i}")), TenantId::new()).await.unwrap();
        }

        let mut pool = build_pool(&server, queue.clone()).await;
        pool.spawn_workers().await;

        // Workers poll every 10ms; give them time to drain the queue.
        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(queue.is_empty(), "all events drained");

        let stats = pool.stats().await;
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.events_processed, 5);

        pool.shutdown_graceful().await.expect("graceful shutdown");
    }
}
