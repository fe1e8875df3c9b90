//! Herald scheduler: turns due notifications into queue messages.

pub mod producer;

pub use producer::{DueItemProducer, PollOutcome, ProducerSettings};
