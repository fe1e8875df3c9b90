//! Herald notifier: delivery channels and the queue consumer.
//!
//! - [`sender`]: the delivery contract every channel implements
//! - [`email`] / [`telegram`]: concrete channels
//! - [`registry`]: channel tag → sender lookup, built once at startup
//! - [`consumer`]: receives published notifications and records outcomes

pub mod consumer;
pub mod email;
pub mod registry;
pub mod sender;
pub mod telegram;

pub use consumer::{ConsumerSettings, DeliveryConsumer};
pub use registry::SenderRegistry;
pub use sender::{DeliveryError, Sender};
