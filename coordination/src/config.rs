use std::time::Duration;

/// Connection and retry settings for one coordinating instance.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounds for the registry's compare-and-swap retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up with [`Error::ContentionExhausted`](crate::Error::ContentionExhausted).
    pub max_attempts: u32,
    /// Backoff cap doubles from here on every lost attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
        }
    }
}
