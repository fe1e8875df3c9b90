use redis::Client;
use redis::aio::ConnectionManager;

/// Open a Redis connection manager.
///
/// The manager reconnects on its own after a dropped connection; callers
/// still wrap individual commands in the retry policy.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
