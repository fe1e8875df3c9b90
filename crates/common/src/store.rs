//! Notification store: the durable source of truth.
//!
//! The store owns the status state machine. Every status write is guarded by
//! the allowed predecessor statuses, so a write that would break the machine
//! (e.g. touching a terminal notification) affects nothing and reports `false`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::types::{Notification, NotificationStatus};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Atomically claim up to `batch_size` notifications in `status` with
    /// `id > cursor` and `send_at <= due_before`, moving each to Processing.
    ///
    /// Returned notifications are in ascending id order and already carry the
    /// Processing status. Concurrent callers never receive the same row.
    async fn claim_due(
        &self,
        status: NotificationStatus,
        batch_size: u32,
        cursor: Uuid,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>, AppError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    /// Move a notification to `status`. Returns `false` when the notification
    /// is absent or its current status is not a predecessor of `status`.
    async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Result<bool, AppError>;

    async fn insert(&self, notification: &Notification) -> Result<(), AppError>;

    /// Returns `false` when nothing was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool, AppError>;

    /// The `limit` most recently created notifications, newest first.
    async fn bulk_load(&self, limit: i64) -> Result<Vec<Notification>, AppError>;

    /// Return notifications stuck in Processing since before `older_than` to
    /// Pending. Returns how many were reclaimed.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, AppError>;
}

/// PostgreSQL-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn claim_due(
        &self,
        status: NotificationStatus,
        batch_size: u32,
        cursor: Uuid,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>, AppError> {
        // SKIP LOCKED keeps concurrent producers off each other's rows; the
        // outer status check rejects rows another claim already committed.
        let mut claimed: Vec<Notification> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = $5, updated_at = GREATEST(updated_at, NOW())
            WHERE id IN (
                SELECT id
                FROM notifications
                WHERE status = $1
                  AND id > $2
                  AND send_at <= $3
                ORDER BY id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            AND status = $1
            RETURNING id, channel, recipient, message, send_at, status, created_at, updated_at
            "#,
        )
        .bind(status)
        .bind(cursor)
        .bind(due_before)
        .bind(i64::from(batch_size))
        .bind(NotificationStatus::Processing)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        claimed.sort_by_key(|n| n.id);
        Ok(claimed)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as(
            r#"
            SELECT id, channel, recipient, message, send_at, status, created_at, updated_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn update_status(&self, id: Uuid, status: NotificationStatus) -> Result<bool, AppError> {
        let allowed: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, updated_at = GREATEST(updated_at, NOW())
            WHERE id = $2 AND status = ANY($3)
            "#,
        )
        .bind(status)
        .bind(id)
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, channel, recipient, message, send_at, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.id)
        .bind(notification.channel.as_str())
        .bind(&notification.recipient)
        .bind(&notification.message)
        .bind(notification.send_at)
        .bind(notification.status)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn bulk_load(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as(
            r#"
            SELECT id, channel, recipient, message, send_at, status, created_at, updated_at
            FROM notifications
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, updated_at = GREATEST(updated_at, NOW())
            WHERE status = $2 AND updated_at < $3
            "#,
        )
        .bind(NotificationStatus::Pending)
        .bind(NotificationStatus::Processing)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
