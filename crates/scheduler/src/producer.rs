//! Due-item producer.
//!
//! Polls the store for Pending notifications whose send time has arrived,
//! claims them in id-ordered batches (claiming moves them to Processing in
//! the same statement), and publishes each one to the queue.
//!
//! The claim commits before the publish, so a publish that fails for good
//! leaves its notification in Processing. With a processing lease configured,
//! such notifications are returned to Pending on the next idle poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::queue::MessageQueue;
use herald_common::retry::RetryPolicy;
use herald_common::store::NotificationStore;
use herald_common::types::{Notification, NotificationStatus, encode_payload};

/// Tunables of the polling loop.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Queue topic to publish to.
    pub topic: String,
    /// Maximum notifications claimed per poll.
    pub batch_size: u32,
    /// Sleep between polls when nothing is due.
    pub poll_interval: Duration,
    /// How far ahead of this process's clock a notification counts as due.
    pub due_skew: Duration,
    /// Age after which a Processing notification is reclaimed; `None` disables.
    pub processing_lease: Option<Duration>,
}

impl ProducerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topic: config.queue_topic.clone(),
            batch_size: config.producer_batch_size,
            poll_interval: Duration::from_millis(config.producer_poll_interval_ms),
            due_skew: Duration::from_millis(config.producer_due_skew_ms),
            processing_lease: config.processing_lease(),
        }
    }
}

/// Result of a single claim-and-publish cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Claimed but not published because cancellation was observed.
    pub skipped: usize,
}

pub struct DueItemProducer {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn MessageQueue>,
    retry: RetryPolicy,
    settings: ProducerSettings,
}

impl DueItemProducer {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn MessageQueue>,
        retry: RetryPolicy,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            retry,
            settings,
        }
    }

    /// Run the polling loop until `cancel` fires.
    ///
    /// Transient failures are logged and retried on the next poll; this loop
    /// never ends on its own.
    pub async fn run(&self, cancel: &CancellationToken) {
        let mut cursor = Uuid::nil();

        tracing::info!(
            topic = %self.settings.topic,
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            lease_secs = self.settings.processing_lease.map(|l| l.as_secs()),
            "Due-item producer started"
        );

        while !cancel.is_cancelled() {
            match self.poll_once(&mut cursor, cancel).await {
                Ok(outcome) if outcome.claimed > 0 => {
                    tracing::info!(
                        claimed = outcome.claimed,
                        published = outcome.published,
                        failed = outcome.failed,
                        skipped = outcome.skipped,
                        "Batch published"
                    );
                    continue;
                }
                Ok(_) => {
                    self.reclaim_stale(cancel).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim due notifications");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        tracing::info!("Due-item producer stopped");
    }

    /// Claim one batch after `cursor` and publish it.
    ///
    /// Advances `cursor` past every successfully published notification, and
    /// resets it to the minimum id when nothing was due.
    pub async fn poll_once(
        &self,
        cursor: &mut Uuid,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, herald_common::error::AppError> {
        let due_before = due_cutoff(Utc::now(), self.settings.due_skew);
        let after = *cursor;

        let batch = self
            .retry
            .run_until(cancel, "store.claim_due", || {
                self.store.claim_due(
                    NotificationStatus::Pending,
                    self.settings.batch_size.max(1),
                    after,
                    due_before,
                )
            })
            .await?;

        let mut outcome = PollOutcome {
            claimed: batch.len(),
            ..PollOutcome::default()
        };

        if batch.is_empty() {
            *cursor = Uuid::nil();
            return Ok(outcome);
        }

        for notification in &batch {
            if cancel.is_cancelled() {
                outcome.skipped = outcome.claimed - outcome.published - outcome.failed;
                tracing::warn!(
                    skipped = outcome.skipped,
                    "Cancelled mid-batch, leaving claimed notifications for reclaim"
                );
                break;
            }

            match self.publish(notification, cancel).await {
                Ok(()) => {
                    *cursor = notification.id;
                    outcome.published += 1;
                }
                Err(e) => {
                    tracing::error!(
                        notification_id = %notification.id,
                        error = %e,
                        "Failed to publish notification, it stays processing"
                    );
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn publish(
        &self,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> Result<(), herald_common::error::AppError> {
        let payload = encode_payload(notification)?;

        self.retry
            .run_until(cancel, "queue.publish", || {
                self.queue.publish(&self.settings.topic, &payload)
            })
            .await?;

        tracing::debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            topic = %self.settings.topic,
            "Notification published"
        );
        Ok(())
    }

    /// Return notifications whose processing lease expired to Pending.
    pub async fn reclaim_stale(&self, cancel: &CancellationToken) -> u64 {
        let Some(lease) = self.settings.processing_lease else {
            return 0;
        };
        let older_than = lease_cutoff(Utc::now(), lease);

        match self
            .retry
            .run_until(cancel, "store.reclaim_stale", || {
                self.store.reclaim_stale(older_than)
            })
            .await
        {
            Ok(0) => 0,
            Ok(reclaimed) => {
                tracing::warn!(
                    reclaimed,
                    lease_secs = lease.as_secs(),
                    "Reclaimed notifications stuck in processing"
                );
                reclaimed
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reclaim stale notifications");
                0
            }
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Latest `send_at` that counts as due; saturates instead of overflowing.
fn due_cutoff(now: DateTime<Utc>, skew: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(skew))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Processing rows last touched before this are reclaimed.
fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_delta(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_delta() {
        assert_eq!(to_delta(Duration::from_secs(3)), TimeDelta::seconds(3));
        assert_eq!(to_delta(Duration::MAX), TimeDelta::MAX);
    }

    #[test]
    fn test_cutoffs_saturate_on_huge_durations() {
        let now = Utc::now();
        assert_eq!(due_cutoff(now, Duration::from_secs(3)), now + TimeDelta::seconds(3));
        assert_eq!(lease_cutoff(now, Duration::from_secs(60)), now - TimeDelta::seconds(60));

        assert_eq!(due_cutoff(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(lease_cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = AppConfig::for_tests();
        config.processing_lease_secs = 120;

        let settings = ProducerSettings::from_config(&config);
        assert_eq!(settings.topic, "notifications");
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.due_skew, Duration::from_secs(3));
        assert_eq!(settings.processing_lease, Some(Duration::from_secs(120)));
    }
}
