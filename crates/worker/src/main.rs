use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use herald_common::cache::{RedisStatusCache, StatusCache};
use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::lifecycle::NotificationLifecycle;
use herald_common::queue::{MessageQueue, RedisQueue};
use herald_common::redis_pool;
use herald_common::store::{NotificationStore, PgNotificationStore};
use herald_notifier::{ConsumerSettings, DeliveryConsumer, SenderRegistry};
use herald_scheduler::{DueItemProducer, ProducerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald_worker=info,herald_scheduler=info,herald_notifier=info,herald_common=info"
                    .into()
            }),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    let config = AppConfig::from_env()?;
    let retry = config.retry_policy();

    // Store
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool));

    // Status cache, warmed with the most recent notifications
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let cache: Arc<dyn StatusCache> =
        Arc::new(RedisStatusCache::new(redis).with_ttl(config.cache_ttl_secs));

    let lifecycle = NotificationLifecycle::new(store.clone(), cache.clone(), retry);
    if let Err(e) = lifecycle.warm_cache(config.cache_warm_limit).await {
        tracing::warn!(error = %e, "Cache warm-up failed, statuses will be cached on demand");
    }

    // One queue connection each, so a blocking receive never holds up publishing
    let producer_queue = Arc::new(
        retry
            .run("queue.open", || RedisQueue::open(&config.redis_url))
            .await?,
    );
    let consumer_queue = Arc::new(
        retry
            .run("queue.open", || RedisQueue::open(&config.redis_url))
            .await?,
    );

    let registry = Arc::new(SenderRegistry::from_config(&config)?);

    let producer = DueItemProducer::new(
        store.clone(),
        producer_queue.clone(),
        retry,
        ProducerSettings::from_config(&config),
    );
    let consumer = DeliveryConsumer::new(
        store,
        cache,
        consumer_queue.clone(),
        registry,
        retry,
        ConsumerSettings::from_config(&config),
    );

    let cancel = CancellationToken::new();

    let mut producer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { producer.run(&cancel).await }
    });
    let mut consumer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { consumer.run(&cancel).await }
    });

    // Run until Ctrl+C, or until either loop exits on its own
    let mut producer_exit = None;
    let consumer_result = tokio::select! {
        result = &mut consumer_task => {
            tracing::error!("Delivery consumer exited, shutting down");
            cancel.cancel();
            result
        }
        result = &mut producer_task => {
            tracing::error!("Due-item producer exited, shutting down");
            cancel.cancel();
            producer_exit = Some(result);
            consumer_task.await
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            cancel.cancel();
            consumer_task.await
        }
    };

    // The producer only returns on cancellation, so an earlier exit is an error.
    let producer_result = match producer_exit {
        Some(Ok(())) => Err(anyhow::anyhow!("Due-item producer stopped before shutdown")),
        Some(Err(e)) => Err(e.into()),
        None => producer_task.await.map_err(anyhow::Error::from),
    };
    if let Err(e) = &producer_result {
        tracing::error!(error = %e, "Due-item producer task failed");
    }

    for queue in [producer_queue, consumer_queue] {
        if let Err(e) = retry.run("queue.close", || queue.close()).await {
            tracing::warn!(error = %e, "Failed to close queue");
        }
    }

    consumer_result??;
    producer_result?;

    tracing::info!("Herald worker stopped.");
    Ok(())
}
