use async_trait::async_trait;
use thiserror::Error;

/// Why a single delivery attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The channel could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The channel was reached but refused the message.
    #[error("Rejected by channel: {0}")]
    Rejected(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// A delivery channel.
///
/// `send` makes exactly one attempt. Callers treat any error as final for
/// that notification.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), DeliveryError>;
}
