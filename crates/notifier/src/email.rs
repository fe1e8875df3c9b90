//! Email delivery through an SMTP relay (STARTTLS).

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use herald_common::error::AppError;

use crate::sender::{DeliveryError, Sender};

/// Subject line of every notification email.
pub const SUBJECT: &str = "Notification";

/// SMTP relay connection settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    /// Build the relay transport. No connection is made until the first send.
    pub fn new(settings: &SmtpSettings) -> Result<Self, AppError> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| AppError::Config(format!("invalid sender address {}: {e}", settings.from)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .map_err(|e| AppError::Config(format!("invalid SMTP relay {}: {e}", settings.host)))?
            .port(settings.port);

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    /// Plain-text email for `recipient`.
    pub fn build_message(&self, recipient: &str, message: &str) -> Result<Message, DeliveryError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| DeliveryError::InvalidRecipient(format!("{recipient}: {e}")))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(message.to_string())
            .map_err(|e| DeliveryError::Rejected(e.to_string()))
    }
}

#[async_trait]
impl Sender for EmailSender {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), DeliveryError> {
        let email = self.build_message(recipient, message)?;

        self.transport.send(email).await.map_err(|e| {
            if e.is_permanent() {
                DeliveryError::Rejected(e.to_string())
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        tracing::debug!(recipient, "Email accepted by relay");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: Some("mailer".to_string()),
            password: Some("secret".to_string()),
            from: "Herald <noreply@example.com>".to_string(),
        }
    }

    #[test]
    fn test_message_is_plain_text_with_subject() {
        let sender = EmailSender::new(&settings()).unwrap();
        let email = sender
            .build_message("alice@example.com", "Your order shipped")
            .unwrap();

        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("Subject: Notification"));
        assert!(raw.contains("alice@example.com"));
        assert!(raw.contains("noreply@example.com"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("Your order shipped"));
    }

    #[test]
    fn test_invalid_recipient() {
        let sender = EmailSender::new(&settings()).unwrap();
        let err = sender.build_message("not an address", "hi").unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidRecipient(_)));
    }

    #[test]
    fn test_invalid_from_is_config_error() {
        let mut bad = settings();
        bad.from = "nobody".to_string();
        assert!(matches!(EmailSender::new(&bad), Err(AppError::Config(_))));
    }
}
