//! Notification lifecycle operations shared by ingestion callers.
//!
//! The store is authoritative; the cache only mirrors status. Reads go
//! cache-aside, writes go to the store first and are then mirrored.

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::StatusCache;
use crate::error::AppError;
use crate::retry::RetryPolicy;
use crate::store::NotificationStore;
use crate::types::{Notification, NotificationStatus};

pub struct NotificationLifecycle {
    store: Arc<dyn NotificationStore>,
    cache: Arc<dyn StatusCache>,
    retry: RetryPolicy,
}

impl NotificationLifecycle {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        cache: Arc<dyn StatusCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            retry,
        }
    }

    /// Current status of a notification, or `None` if it does not exist.
    ///
    /// Checks the cache first; on a miss reads the store and caches the
    /// status. A cache failure never fails the read.
    pub async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>, AppError> {
        match self
            .retry
            .run("cache.get_status", || self.cache.get_status(id))
            .await
        {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Cache read failed, falling back to store");
            }
        }

        let Some(notification) = self
            .retry
            .run("store.get_by_id", || self.store.get_by_id(id))
            .await?
        else {
            return Ok(None);
        };

        if let Err(e) = self
            .retry
            .run("cache.set_status", || {
                self.cache.set_status(id, notification.status)
            })
            .await
        {
            tracing::warn!(notification_id = %id, error = %e, "Failed to populate status cache");
        }

        Ok(Some(notification.status))
    }

    /// Persist a new Pending notification and mirror its status.
    ///
    /// Fails only if the insert fails. Once the row exists a cache failure is
    /// logged, and the status is cached on the next read.
    pub async fn schedule(&self, notification: &Notification) -> Result<(), AppError> {
        if notification.status != NotificationStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: notification.status,
                to: NotificationStatus::Pending,
            });
        }

        self.retry
            .run("store.insert", || self.store.insert(notification))
            .await?;
        if let Err(e) = self
            .retry
            .run("cache.set_status", || {
                self.cache
                    .set_status(notification.id, NotificationStatus::Pending)
            })
            .await
        {
            tracing::warn!(notification_id = %notification.id, error = %e, "Failed to mirror scheduled status");
        }

        tracing::info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            send_at = %notification.send_at,
            "Notification scheduled"
        );
        Ok(())
    }

    /// Cancel a Pending notification. Returns `false` if it was not Pending.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, AppError> {
        let canceled = self
            .retry
            .run("store.update_status", || {
                self.store.update_status(id, NotificationStatus::Canceled)
            })
            .await?;

        if canceled {
            self.retry
                .run("cache.set_status", || {
                    self.cache.set_status(id, NotificationStatus::Canceled)
                })
                .await?;
            tracing::info!(notification_id = %id, "Notification canceled");
        }

        Ok(canceled)
    }

    /// Delete a notification from the store and the cache.
    pub async fn remove(&self, id: Uuid) -> Result<(), AppError> {
        let deleted = self
            .retry
            .run("store.delete", || self.store.delete(id))
            .await?;
        self.retry
            .run("cache.delete", || self.cache.delete(id))
            .await?;

        if !deleted {
            return Err(AppError::NotFound(format!("notification {id}")));
        }
        Ok(())
    }

    /// Mirror the statuses of the `limit` most recent notifications into the
    /// cache. Returns how many were cached.
    pub async fn warm_cache(&self, limit: i64) -> Result<usize, AppError> {
        let notifications = self
            .retry
            .run("store.bulk_load", || self.store.bulk_load(limit))
            .await?;

        for notification in &notifications {
            self.retry
                .run("cache.set_status", || {
                    self.cache.set_status(notification.id, notification.status)
                })
                .await?;
        }

        tracing::info!(count = notifications.len(), "Status cache warmed");
        Ok(notifications.len())
    }
}
