use std::str::FromStr;
use std::time::Duration;

use crate::retry::{MAX_RETRY_DELAY, RetryPolicy};

/// Upper bound on `PRODUCER_DUE_SKEW_MS`.
pub const MAX_DUE_SKEW: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on `PROCESSING_LEASE_SECS`.
pub const MAX_PROCESSING_LEASE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (status cache and queue)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Queue topic the producer publishes to and the consumer reads from
    pub queue_topic: String,

    /// Attempts per store/cache/queue call, including the first (default: 3)
    pub retry_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 1000)
    pub retry_delay_ms: u64,

    /// Backoff multiplier applied to the retry delay (default: 2.0)
    pub retry_backoff: f64,

    /// Maximum notifications claimed per poll (default: 100)
    pub producer_batch_size: u32,

    /// Sleep between polls when nothing is due, in milliseconds (default: 2000)
    pub producer_poll_interval_ms: u64,

    /// How far ahead of the producer's clock a notification counts as due (default: 3000)
    pub producer_due_skew_ms: u64,

    /// Seconds a notification may stay processing before it is reclaimed; 0 disables
    pub processing_lease_secs: u64,

    /// Capacity of the consumer's receive → process handoff queue (default: 8)
    pub consumer_handoff_capacity: usize,

    /// How long a single queue receive blocks, in milliseconds (default: 1000)
    pub consumer_receive_wait_ms: u64,

    /// Number of recent notifications mirrored into the cache at startup (default: 1000)
    pub cache_warm_limit: i64,

    /// Optional TTL of cached statuses in seconds
    pub cache_ttl_secs: Option<u64>,

    /// SMTP relay host for email delivery
    pub smtp_host: Option<String>,

    /// SMTP relay port (default: 587)
    pub smtp_port: u16,

    /// SMTP username
    pub smtp_user: Option<String>,

    /// SMTP password
    pub smtp_password: Option<String>,

    /// Email sender address (defaults to the SMTP user)
    pub smtp_from: Option<String>,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL
    pub telegram_api_url: String,

    /// Timeout of a single Telegram request in seconds (default: 10)
    pub telegram_timeout_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            queue_topic: std::env::var("QUEUE_TOPIC")
                .unwrap_or_else(|_| "notifications".to_string()),
            retry_attempts: parse_var("RETRY_ATTEMPTS", 3)?,
            retry_delay_ms: parse_var("RETRY_DELAY_MS", 1000)?,
            retry_backoff: parse_var("RETRY_BACKOFF", 2.0)?,
            producer_batch_size: parse_var("PRODUCER_BATCH_SIZE", 100)?,
            producer_poll_interval_ms: parse_var("PRODUCER_POLL_INTERVAL_MS", 2000)?,
            producer_due_skew_ms: parse_var("PRODUCER_DUE_SKEW_MS", 3000)?,
            processing_lease_secs: parse_var("PROCESSING_LEASE_SECS", 600)?,
            consumer_handoff_capacity: parse_var("CONSUMER_HANDOFF_CAPACITY", 8)?,
            consumer_receive_wait_ms: parse_var("CONSUMER_RECEIVE_WAIT_MS", 1000)?,
            cache_warm_limit: parse_var("CACHE_WARM_LIMIT", 1000)?,
            cache_ttl_secs: std::env::var("CACHE_TTL_SECS")
                .ok()
                .map(|v| {
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("CACHE_TTL_SECS must be a valid u64"))
                })
                .transpose()?,
            smtp_host: std::env::var("SMTP_HOST").ok(),
            smtp_port: parse_var("SMTP_PORT", 587)?,
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
            smtp_from: std::env::var("SMTP_FROM").ok(),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            telegram_timeout_secs: parse_var("TELEGRAM_TIMEOUT_SECS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but would stall or crash the worker loops.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.retry_backoff.is_finite() || self.retry_backoff < 1.0 {
            anyhow::bail!("RETRY_BACKOFF must be a valid finite number >= 1.0");
        }
        if Duration::from_millis(self.retry_delay_ms) > MAX_RETRY_DELAY {
            anyhow::bail!(
                "RETRY_DELAY_MS must be a valid delay of at most {} ms",
                MAX_RETRY_DELAY.as_millis()
            );
        }
        if self.producer_batch_size == 0 {
            anyhow::bail!("PRODUCER_BATCH_SIZE must be a valid batch size of at least 1");
        }
        if self.producer_poll_interval_ms == 0 {
            anyhow::bail!("PRODUCER_POLL_INTERVAL_MS must be a valid interval of at least 1 ms");
        }
        if Duration::from_millis(self.producer_due_skew_ms) > MAX_DUE_SKEW {
            anyhow::bail!(
                "PRODUCER_DUE_SKEW_MS must be a valid skew of at most {} ms",
                MAX_DUE_SKEW.as_millis()
            );
        }
        if Duration::from_secs(self.processing_lease_secs) > MAX_PROCESSING_LEASE {
            anyhow::bail!(
                "PROCESSING_LEASE_SECS must be a valid lease of at most {} s",
                MAX_PROCESSING_LEASE.as_secs()
            );
        }
        if self.consumer_handoff_capacity == 0 {
            anyhow::bail!("CONSUMER_HANDOFF_CAPACITY must be a valid capacity of at least 1");
        }
        // BLMOVE treats a zero wait as "block forever".
        if self.consumer_receive_wait_ms == 0 {
            anyhow::bail!("CONSUMER_RECEIVE_WAIT_MS must be a valid wait of at least 1 ms");
        }
        if self.telegram_timeout_secs == 0 {
            anyhow::bail!("TELEGRAM_TIMEOUT_SECS must be a valid timeout of at least 1 s");
        }
        Ok(())
    }

    /// Retry policy for store, cache and queue calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
            self.retry_backoff,
        )
    }

    /// Processing lease, or `None` when reclaim is disabled.
    pub fn processing_lease(&self) -> Option<Duration> {
        (self.processing_lease_secs > 0).then(|| Duration::from_secs(self.processing_lease_secs))
    }
}

/// Parse an optional environment variable, falling back to `default`.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

#[cfg(any(test, feature = "test-util"))]
impl AppConfig {
    /// Defaults with no senders configured and reclaim disabled.
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://unused".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            db_max_connections: 5,
            queue_topic: "notifications".to_string(),
            retry_attempts: 5,
            retry_delay_ms: 250,
            retry_backoff: 1.5,
            producer_batch_size: 100,
            producer_poll_interval_ms: 2000,
            producer_due_skew_ms: 3000,
            processing_lease_secs: 0,
            consumer_handoff_capacity: 8,
            consumer_receive_wait_ms: 1000,
            cache_warm_limit: 1000,
            cache_ttl_secs: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            smtp_from: None,
            telegram_bot_token: None,
            telegram_api_url: "https://api.telegram.org".to_string(),
            telegram_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_from_config() {
        let policy = AppConfig::for_tests().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.backoff_multiplier, 1.5);
    }

    #[test]
    fn test_zero_lease_disables_reclaim() {
        let mut config = AppConfig::for_tests();
        assert_eq!(config.processing_lease(), None);
        config.processing_lease_secs = 30;
        assert_eq!(config.processing_lease(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u32 = parse_var("HERALD_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::for_tests().validate().unwrap();
    }

    fn rejected(config: AppConfig, variable: &str) {
        let err = config.validate().unwrap_err().to_string();
        assert!(err.starts_with(variable), "unexpected error: {err}");
        assert!(err.contains("must be a valid"), "unexpected error: {err}");
    }

    #[test]
    fn test_unusable_backoff_is_rejected() {
        for backoff in [f64::INFINITY, f64::NAN, 0.5, -2.0] {
            let mut config = AppConfig::for_tests();
            config.retry_backoff = backoff;
            rejected(config, "RETRY_BACKOFF");
        }

        let mut config = AppConfig::for_tests();
        config.retry_backoff = 1e300;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        let mut config = AppConfig::for_tests();
        config.producer_batch_size = 0;
        rejected(config, "PRODUCER_BATCH_SIZE");

        let mut config = AppConfig::for_tests();
        config.producer_poll_interval_ms = 0;
        rejected(config, "PRODUCER_POLL_INTERVAL_MS");

        let mut config = AppConfig::for_tests();
        config.consumer_handoff_capacity = 0;
        rejected(config, "CONSUMER_HANDOFF_CAPACITY");

        let mut config = AppConfig::for_tests();
        config.consumer_receive_wait_ms = 0;
        rejected(config, "CONSUMER_RECEIVE_WAIT_MS");

        let mut config = AppConfig::for_tests();
        config.telegram_timeout_secs = 0;
        rejected(config, "TELEGRAM_TIMEOUT_SECS");
    }

    #[test]
    fn test_unbounded_durations_are_rejected() {
        let mut config = AppConfig::for_tests();
        config.producer_due_skew_ms = u64::MAX;
        rejected(config, "PRODUCER_DUE_SKEW_MS");

        let mut config = AppConfig::for_tests();
        config.processing_lease_secs = u64::MAX;
        rejected(config, "PROCESSING_LEASE_SECS");

        let mut config = AppConfig::for_tests();
        config.retry_delay_ms = u64::MAX;
        rejected(config, "RETRY_DELAY_MS");

        let mut config = AppConfig::for_tests();
        config.producer_due_skew_ms = MAX_DUE_SKEW.as_millis() as u64;
        config.processing_lease_secs = MAX_PROCESSING_LEASE.as_secs();
        config.validate().unwrap();
    }
}
