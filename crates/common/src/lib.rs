//! Shared building blocks for the delayed-notification pipeline: the data
//! model and status state machine, configuration, the retry policy, and the
//! store, cache and queue contracts with their Postgres and Redis adapters.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod redis_pool;
pub mod retry;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
