use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

use fanout_events::{BroadcastChannel, DurableQueue, subscriber_fn};
#[cfg(feature = "kafka")]
use fanout_infra::event_bus::KafkaBroadcast;
use fanout_infra::event_bus::{RedisBroadcast, RedisJobQueue};
use fanout_infra::jobs::{ClaimQueue, PostgresJobQueue};
use fanout_infra::kv::RedisKeyValue;
use fanout_infra::{BusConfig, EventBusService, consumer_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fanout_observability::init();

    let config = BusConfig::from_env().context("invalid event bus configuration")?;
    let redis_url = config.redis.url();

    RedisKeyValue::new(&redis_url)?
        .ping()
        .await
        .context("redis is unreachable")?;

    let broadcast = broadcast_channel(&config, &redis_url)?;

    match config.database_url.clone() {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.concurrency as u32 + 2)
                .connect(&database_url)
                .await
                .context("failed to connect to postgres")?;
            let queue = PostgresJobQueue::new(pool, config.queue_key());
            queue.ensure_schema().await?;
            tracing::info!(queue = %config.queue_key(), "using postgres job queue");
            run(Arc::new(queue), broadcast, &config).await
        }
        None => {
            let queue = RedisJobQueue::new(&redis_url, &config.queue_key())?;
            tracing::info!(queue = %config.queue_key(), "using redis job queue");
            run(Arc::new(queue), broadcast, &config).await
        }
    }
}

/// Kafka when brokers are configured and the `kafka` feature is on, Redis pub/sub otherwise.
fn broadcast_channel(
    config: &BusConfig,
    redis_url: &str,
) -> anyhow::Result<Arc<dyn BroadcastChannel>> {
    #[cfg(feature = "kafka")]
    if let Some(kafka) = &config.kafka {
        let client_id = if config.app_name.is_empty() {
            "fanout-worker"
        } else {
            config.app_name.as_str()
        };
        let broadcast = KafkaBroadcast::new(kafka, client_id).context("invalid kafka settings")?;
        tracing::info!(brokers = %kafka.brokers.join(","), "using kafka broadcast");
        return Ok(Arc::new(broadcast));
    }

    #[cfg(not(feature = "kafka"))]
    if config.kafka.is_some() {
        tracing::warn!("KAFKA_BROKERS is set but kafka support is not compiled in, using redis");
    }

    let redis = RedisBroadcast::new(redis_url, "")?;
    let mut observed = redis.subscribe("*");
    tokio::spawn(async move {
        while let Some(published) = observed.recv().await {
            tracing::debug!(topic = %published.topic, "broadcast observed");
        }
    });
    tracing::info!("using redis broadcast");
    Ok(Arc::new(redis))
}

async fn run<Q>(
    queue: Arc<Q>,
    broadcast: Arc<dyn BroadcastChannel>,
    config: &BusConfig,
) -> anyhow::Result<()>
where
    Q: DurableQueue + ClaimQueue + 'static,
{
    let service = EventBusService::from_config(queue, broadcast, config);

    service.subscribe(
        "*",
        subscriber_fn(|payload, event_name| async move {
            tracing::info!(event_name = %event_name, payload = %payload, "event received");
            Ok(json!(null))
        }),
        Some("event-log".into()),
    );

    let handle = service.consumer(consumer_config(config)).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    let stats = handle.shutdown().await;
    tracing::info!(
        processed = stats.attempts_processed,
        resolved = stats.resolved,
        retried = stats.retried,
        failed = stats.failed,
        "worker stopped"
    );
    Ok(())
}
