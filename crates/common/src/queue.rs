//! Message queue between the producer and the consumer.
//!
//! Delivery is at-least-once: a received message moves to an in-flight list
//! and stays there until acknowledged. Subscribing to a topic puts anything
//! left in flight by a previous consumer back onto the topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;

use crate::error::AppError;

/// A message taken off a topic, awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
    /// Handle used to acknowledge this delivery.
    pub receipt: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError>;

    /// Prepare `topic` for receiving. Returns how many unacknowledged
    /// deliveries were put back for redelivery.
    ///
    /// Everything in flight on `topic` is treated as abandoned, so call this
    /// only while no other consumer of the topic is running.
    async fn subscribe(&self, topic: &str) -> Result<u64, AppError>;

    /// Wait up to `wait` for the next message on `topic`.
    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, AppError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Close the queue. Every later call fails with [`AppError::QueueClosed`].
    async fn close(&self) -> Result<(), AppError>;
}

/// Redis list-based reliable queue.
///
/// Publishing pushes onto `herald:queue:{topic}`; receiving atomically moves
/// the oldest message onto `herald:queue:{topic}:inflight` (`BLMOVE`), and
/// acknowledging removes it from there.
///
/// A topic has one in-flight list, shared by everything receiving from it,
/// so each topic must have exactly one running consumer. A second consumer
/// subscribing would requeue deliveries the first is still processing.
pub struct RedisQueue {
    conn: ConnectionManager,
    key_prefix: String,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Connect to Redis. Each producer or consumer opens its own queue so a
    /// blocking receive never holds up publishing.
    pub async fn open(redis_url: &str) -> Result<Self, AppError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!("Queue connection opened");
        Ok(Self {
            conn,
            key_prefix: "herald:queue".to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:{}", self.key_prefix, topic)
    }

    fn inflight_key(&self, topic: &str) -> String {
        format!("{}:{}:inflight", self.key_prefix, topic)
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::QueueClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("LPUSH")
            .arg(self.topic_key(topic))
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<u64, AppError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let inflight = self.inflight_key(topic);
        let ready = self.topic_key(topic);

        // Newest in-flight first onto the consuming end, so the oldest
        // ends up being received first.
        let mut requeued = 0u64;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&inflight)
                .arg(&ready)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;

            if moved.is_none() {
                break;
            }
            requeued += 1;
        }

        if requeued > 0 {
            tracing::info!(topic, requeued, "Requeued unacknowledged deliveries");
        }
        Ok(requeued)
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, AppError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(self.topic_key(topic))
            .arg(self.inflight_key(topic))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        Ok(payload.map(|payload| Delivery {
            topic: topic.to_string(),
            receipt: payload.clone(),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("LREM")
            .arg(self.inflight_key(&delivery.topic))
            .arg(1)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Queue connection closed");
        }
        Ok(())
    }
}
