//! Delivery consumer.
//!
//! Two loops joined by a bounded handoff channel: the receive loop pulls
//! deliveries off the queue, the processing loop dispatches them one at a
//! time in receive order and records the outcome in the store and the cache.
//!
//! A delivery is acknowledged only after its status writes were attempted.
//! Anything received but not acknowledged when the consumer stops is
//! redelivered on the next subscribe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::cache::StatusCache;
use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::queue::{Delivery, MessageQueue};
use herald_common::retry::RetryPolicy;
use herald_common::store::NotificationStore;
use herald_common::types::{Notification, NotificationStatus, decode_payload};

use crate::registry::SenderRegistry;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Queue topic to consume.
    pub topic: String,
    /// Capacity of the receive → process handoff channel.
    pub handoff_capacity: usize,
    /// How long a single receive blocks before cancellation is rechecked.
    pub receive_wait: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topic: config.queue_topic.clone(),
            handoff_capacity: config.consumer_handoff_capacity,
            receive_wait: Duration::from_millis(config.consumer_receive_wait_ms),
        }
    }
}

pub struct DeliveryConsumer {
    store: Arc<dyn NotificationStore>,
    cache: Arc<dyn StatusCache>,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<SenderRegistry>,
    retry: RetryPolicy,
    settings: ConsumerSettings,
}

impl DeliveryConsumer {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        cache: Arc<dyn StatusCache>,
        queue: Arc<dyn MessageQueue>,
        registry: Arc<SenderRegistry>,
        retry: RetryPolicy,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            registry,
            retry,
            settings,
        }
    }

    /// Consume until `cancel` fires.
    ///
    /// Returns an error only when the queue itself fails: subscribing or
    /// receiving still fails after the retry budget. Payloads already handed
    /// off are processed before the error is returned.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let (tx, rx) = mpsc::channel(self.settings.handoff_capacity.max(1));

        tracing::info!(
            topic = %self.settings.topic,
            handoff_capacity = self.settings.handoff_capacity,
            channels = self.registry.len(),
            "Delivery consumer started"
        );

        let (received, processed) =
            tokio::join!(self.receive_loop(tx, cancel), self.process_loop(rx, cancel));

        match &received {
            Ok(()) => tracing::info!(processed, "Delivery consumer stopped"),
            Err(e) => tracing::error!(processed, error = %e, "Delivery consumer failed"),
        }
        received
    }

    async fn receive_loop(
        &self,
        tx: mpsc::Sender<Delivery>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let topic = self.settings.topic.as_str();

        let requeued = self
            .retry
            .run_until(cancel, "queue.subscribe", || self.queue.subscribe(topic))
            .await?;
        tracing::info!(topic, requeued, "Subscribed to queue");

        while !cancel.is_cancelled() {
            let received = self
                .retry
                .run_until(cancel, "queue.receive", || {
                    self.queue.receive(topic, self.settings.receive_wait)
                })
                .await;

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => return Err(e),
            };

            tokio::select! {
                // Left unacknowledged; redelivered after the next subscribe.
                _ = cancel.cancelled() => break,
                sent = tx.send(delivery) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns how many deliveries were processed.
    async fn process_loop(
        &self,
        mut rx: mpsc::Receiver<Delivery>,
        cancel: &CancellationToken,
    ) -> usize {
        let mut processed = 0;

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            self.process_payload(&delivery.payload).await;

            if let Err(e) = self
                .retry
                .run("queue.ack", || self.queue.ack(&delivery))
                .await
            {
                tracing::warn!(error = %e, "Failed to acknowledge delivery, it will be redelivered");
            }
            processed += 1;
        }

        processed
    }

    /// Dispatch one payload and record the outcome.
    ///
    /// Returns the status the notification was moved to, or `None` when
    /// nothing was sent or written: the payload could not be decoded, or it
    /// no longer matches the claim held in the store.
    pub async fn process_payload(&self, payload: &str) -> Option<NotificationStatus> {
        let mut notification = match decode_payload(payload) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable payload");
                return None;
            }
        };

        if !self.claim_is_current(&notification).await {
            return None;
        }

        let outcome = match self.registry.get(&notification.channel) {
            None => {
                tracing::warn!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    "No sender registered for channel"
                );
                NotificationStatus::Failed
            }
            Some(sender) => match sender
                .send(&notification.recipient, &notification.message)
                .await
            {
                Ok(()) => NotificationStatus::Sent,
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        channel = %notification.channel,
                        error = %e,
                        "Delivery failed"
                    );
                    NotificationStatus::Failed
                }
            },
        };

        if let Err(e) = notification.transition(outcome) {
            tracing::warn!(notification_id = %notification.id, error = %e, "Unexpected payload status");
        }

        self.record_status(notification.id, outcome).await;

        tracing::info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            status = %outcome,
            "Notification processed"
        );
        Some(outcome)
    }

    /// Whether the store still holds the claim this payload was published
    /// under: the row is Processing with the payload's `updated_at`.
    ///
    /// A copy from before a lease reclaim, or one whose notification already
    /// reached a final status, fails this check and is dropped unsent.
    async fn claim_is_current(&self, notification: &Notification) -> bool {
        let id = notification.id;
        let stored = match self
            .retry
            .run("store.get_by_id", || self.store.get_by_id(id))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                // Left Processing; the lease returns it to Pending.
                tracing::error!(notification_id = %id, error = %e, "Failed to verify claim, skipping delivery");
                return false;
            }
        };

        match stored {
            Some(row)
                if row.status == NotificationStatus::Processing
                    && row.updated_at == notification.updated_at =>
            {
                true
            }
            Some(row) => {
                tracing::warn!(
                    notification_id = %id,
                    stored_status = %row.status,
                    "Skipping stale delivery, notification was reclaimed or already processed"
                );
                false
            }
            None => {
                tracing::warn!(notification_id = %id, "Skipping delivery of deleted notification");
                false
            }
        }
    }

    /// Persist `status`, then mirror it to the cache. Failures are logged.
    async fn record_status(&self, id: Uuid, status: NotificationStatus) {
        match self
            .retry
            .run("store.update_status", || self.store.update_status(id, status))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    notification_id = %id,
                    status = %status,
                    "Store rejected status change, notification is missing or already final"
                );
                return;
            }
            Err(e) => {
                tracing::error!(notification_id = %id, status = %status, error = %e, "Failed to persist status");
            }
        }

        if let Err(e) = self
            .retry
            .run("cache.set_status", || self.cache.set_status(id, status))
            .await
        {
            tracing::error!(notification_id = %id, status = %status, error = %e, "Failed to cache status");
        }
    }
}
