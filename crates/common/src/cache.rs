//! Status cache: a Redis mirror of each notification's current status.
//!
//! Only the status is cached, never the full entity.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::AppError;
use crate::types::NotificationStatus;

#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), AppError>;

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>, AppError>;

    async fn delete(&self, id: Uuid) -> Result<(), AppError>;
}

/// Redis-backed status cache.
///
/// Keys are `notification:status:{id}`, values the lowercase status tag.
#[derive(Clone)]
pub struct RedisStatusCache {
    conn: ConnectionManager,
    ttl_secs: Option<u64>,
}

impl RedisStatusCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl_secs: None,
        }
    }

    /// Expire cached statuses after `ttl_secs`.
    pub fn with_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.ttl_secs = ttl_secs.filter(|ttl| *ttl > 0);
        self
    }

    fn key(id: Uuid) -> String {
        format!("notification:status:{}", id)
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let key = Self::key(id);

        match self.ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(&key, status.as_str(), ttl).await?,
            None => conn.set::<_, _, ()>(&key, status.as_str()).await?,
        }

        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>, AppError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(id)).await?;

        raw.map(|s| s.parse()).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(id)).await?;
        Ok(())
    }
}
