//! notiq webhook notification service.
//!
//! Entry point wiring: tracing, configuration, Redis, startup recovery,
//! the worker pool, and the HTTP server. Recovery runs to completion
//! before the pool starts so recovered and fresh events cannot race for
//! the same key.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use notiq_api::{start_server, AppState, Config};
use notiq_core::{Clock, Provider, RealClock};
use notiq_engine::{Pipeline, TracingRecordStore, WorkerPool};
use notiq_enrich::{Blender, EnrichmentRegistry, RedisCacheStore};
use notiq_ingest::{ChargifyAdapter, ShopifyAdapter, SourceAdapter, StripeAdapter};
use notiq_notify::{DeliveryClient, RedisThreadStore, SlackFormatter, ThreadStore};
use notiq_queue::{AuditStore, QueueStore, RedisAuditStore, RedisQueueStore};
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting notiq webhook notification service");

    let config = Config::load()?;
    info!(
        redis_url = %config.redis_url_masked(),
        workers = config.worker_pool_size,
        max_attempts = config.max_delivery_attempts,
        "configuration loaded"
    );

    let conn = connect_redis(&config).await?;
    info!("Redis connection established");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let tenant = config.tenant();

    let queue: Arc<dyn QueueStore> = Arc::new(
        RedisQueueStore::new(conn.clone(), clock.clone(), config.retry_policy())
            .with_lease_ttl(config.queue_lease()),
    );
    let audit: Arc<dyn AuditStore> = Arc::new(RedisAuditStore::new(conn.clone()));

    let mut registry = EnrichmentRegistry::new();
    registry.discover(&config.enrichment_config());
    let blender = Arc::new(Blender::new(
        Arc::new(registry),
        Arc::new(RedisCacheStore::new(conn.clone())),
        Arc::new(config.tenant_directory(tenant)),
        clock.clone(),
    ));

    let threads: Arc<dyn ThreadStore> = Arc::new(RedisThreadStore::new(conn));
    let client = DeliveryClient::new(config.delivery_timeout())?;

    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        blender,
        Arc::new(SlackFormatter::new()),
        threads,
        client,
        Arc::new(TracingRecordStore::new()),
        config.notify_target(),
        Duration::from_secs(config.enrich_timeout_secs),
    ));

    // Re-drive events abandoned by a previous instance. Must finish before
    // any worker starts claiming.
    let recovered = queue.recover_orphaned().await?;
    if recovered > 0 {
        info!(recovered, "recovered orphaned events from a previous instance");
    }

    let cancellation = CancellationToken::new();
    let mut pool =
        WorkerPool::new(pipeline, config.pipeline_config(), cancellation.clone(), clock.clone());
    pool.spawn_workers().await;

    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(ChargifyAdapter::new()),
        Arc::new(ShopifyAdapter::new()),
        Arc::new(StripeAdapter::new(clock)),
    ];
    let mut secrets = HashMap::new();
    secrets.insert(Provider::Chargify, config.chargify_webhook_secret.clone());
    secrets.insert(Provider::Shopify, config.shopify_webhook_secret.clone());
    secrets.insert(Provider::Stripe, config.stripe_webhook_secret.clone());

    let state = Arc::new(AppState::new(
        adapters,
        queue,
        audit,
        secrets,
        tenant,
        config.enqueue_timeout(),
    ));

    let addr = config.server_addr()?;
    info!(addr = %addr, "notiq is ready to receive webhooks");

    // Serves until CTRL+C / SIGTERM.
    start_server(state, addr, Duration::from_secs(config.request_timeout_secs)).await?;

    info!("HTTP server stopped, draining workers");
    pool.shutdown_graceful().await?;

    info!("notiq shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,notiq=debug"));

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects to Redis with bounded retries.
async fn connect_redis(config: &Config) -> Result<ConnectionManager> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let client = redis::Client::open(config.redis_url.as_str()).context("invalid Redis URL")?;

    let mut retries = 0;
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(mut conn) => {
                let _: () = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .context("failed to verify Redis connection")?;
                return Ok(conn);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to connect to Redis after retries");
            },
        }
    }
}
