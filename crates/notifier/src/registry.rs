//! Channel → sender lookup.
//!
//! Built once at startup and read-only afterwards. Notifications for a
//! channel without a registered sender are marked failed by the consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::Channel;

use crate::email::{EmailSender, SmtpSettings};
use crate::sender::Sender;
use crate::telegram::TelegramSender;

pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn builder() -> SenderRegistryBuilder {
        SenderRegistryBuilder::default()
    }

    /// Register every channel whose credentials are present in `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let mut builder = Self::builder();

        if let Some(host) = &config.smtp_host {
            let from = config
                .smtp_from
                .clone()
                .or_else(|| config.smtp_user.clone())
                .ok_or_else(|| {
                    AppError::Config("SMTP_HOST is set but neither SMTP_FROM nor SMTP_USER".to_string())
                })?;

            let sender = EmailSender::new(&SmtpSettings {
                host: host.clone(),
                port: config.smtp_port,
                username: config.smtp_user.clone(),
                password: config.smtp_password.clone(),
                from,
            })?;
            builder = builder.register(Channel::Email, sender);
        }

        if let Some(token) = &config.telegram_bot_token {
            let sender = TelegramSender::new(
                &config.telegram_api_url,
                token,
                Duration::from_secs(config.telegram_timeout_secs),
            )?;
            builder = builder.register(Channel::Telegram, sender);
        }

        let registry = builder.build();
        if registry.is_empty() {
            tracing::warn!("No delivery channels configured, every notification will fail");
        } else {
            let channels: Vec<&str> = registry.channels().map(Channel::as_str).collect();
            tracing::info!(channels = ?channels, "Sender registry built");
        }
        Ok(registry)
    }

    pub fn get(&self, channel: &Channel) -> Option<&Arc<dyn Sender>> {
        self.senders.get(channel)
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.senders.contains_key(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.senders.keys()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[derive(Default)]
pub struct SenderRegistryBuilder {
    senders: HashMap<Channel, Arc<dyn Sender>>,
}

impl SenderRegistryBuilder {
    /// Register `sender` for `channel`, replacing any earlier registration.
    pub fn register(mut self, channel: Channel, sender: impl Sender + 'static) -> Self {
        self.senders.insert(channel, Arc::new(sender));
        self
    }

    pub fn build(self) -> SenderRegistry {
        SenderRegistry {
            senders: self.senders,
        }
    }
}
