use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Canceled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Canceled => "canceled",
        }
    }

    /// Sent, Failed and Canceled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the status state machine:
    /// Pending → Processing → {Sent, Failed}, and Pending → Canceled.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Canceled) | (Processing, Sent) | (Processing, Failed)
        )
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [NotificationStatus] {
        use NotificationStatus::*;
        match self {
            Pending => &[],
            Processing => &[Pending],
            Sent | Failed => &[Processing],
            Canceled => &[Pending],
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "processing" => Ok(NotificationStatus::Processing),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "canceled" => Ok(NotificationStatus::Canceled),
            other => Err(AppError::UnknownStatus(other.to_string())),
        }
    }
}

/// Delivery channel of a notification.
///
/// Tags that do not name a known channel are kept as `Unknown` so that a
/// payload for an unregistered channel still decodes and can be marked failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Channel {
    Email,
    Telegram,
    Unknown(String),
}

impl Channel {
    pub fn as_str(&self) -> &str {
        match self {
            Channel::Email => "email",
            Channel::Telegram => "telegram",
            Channel::Unknown(tag) => tag,
        }
    }
}

impl From<String> for Channel {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "email" => Channel::Email,
            "telegram" => Channel::Telegram,
            _ => Channel::Unknown(tag),
        }
    }
}

impl From<&str> for Channel {
    fn from(tag: &str) -> Self {
        Channel::from(tag.to_string())
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification scheduled for delivery at `send_at`.
///
/// This is also the wire payload passed from the producer to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub channel: Channel,
    pub recipient: String,
    pub message: String,
    pub send_at: DateTime<Utc>,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Build a new Pending notification with a fresh id.
    pub fn new(
        channel: Channel,
        recipient: impl Into<String>,
        message: impl Into<String>,
        send_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel,
            recipient: recipient.into(),
            message: message.into(),
            send_at,
            status: NotificationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the notification is Pending and its send time is at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Pending && self.send_at <= now
    }

    /// Move to `next`, bumping `updated_at`.
    pub fn transition(&mut self, next: NotificationStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now().max(self.updated_at);
        Ok(())
    }
}

/// Encode a notification into the queue wire format.
pub fn encode_payload(notification: &Notification) -> Result<String, AppError> {
    Ok(serde_json::to_string(notification)?)
}

/// Decode a queue payload produced by [`encode_payload`].
pub fn decode_payload(payload: &str) -> Result<Notification, AppError> {
    Ok(serde_json::from_str(payload)?)
}
