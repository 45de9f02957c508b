//! Configuration management for the sync runtime.

use stash_engine::TableName;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, built from defaults or environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Quiet period after the last append before a flush starts
    pub debounce: Duration,
    /// Backoff applied after failed flushes
    pub retry: RetryConfig,
    /// Interval of the optional background pull loop
    pub pull_interval: Option<Duration>,
    /// Maximum records requested per changes-since call
    pub pull_page_size: usize,
    /// Tables pulled when no table is named
    pub tables: Vec<TableName>,
    /// Capacity of the status event channel
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            retry: RetryConfig::default(),
            pull_interval: None,
            pull_page_size: 100,
            tables: vec!["events".to_string()],
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let debounce = parse_var::<u64>("STASH_DEBOUNCE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce);

        let retry = RetryConfig {
            initial_delay: parse_var::<u64>("STASH_RETRY_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: parse_var::<u64>("STASH_RETRY_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            factor: parse_var::<f64>("STASH_RETRY_FACTOR")?.unwrap_or(defaults.retry.factor),
        };
        if retry.factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                var: "STASH_RETRY_FACTOR",
                value: retry.factor.to_string(),
            });
        }

        let pull_interval = parse_var::<u64>("STASH_PULL_INTERVAL_MS")?.map(Duration::from_millis);

        let pull_page_size = parse_var::<usize>("STASH_PULL_PAGE_SIZE")?
            .unwrap_or(defaults.pull_page_size);
        if pull_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STASH_PULL_PAGE_SIZE",
                value: "0".to_string(),
            });
        }

        let tables = match env::var("STASH_TABLES") {
            Ok(raw) => parse_tables(&raw)?,
            Err(_) => defaults.tables,
        };

        Ok(Self {
            debounce,
            retry,
            pull_interval,
            pull_page_size,
            tables,
            event_capacity: defaults.event_capacity,
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TableName>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }
}

/// Exponential backoff for failed flushes. There is no attempt limit:
/// mutations leave the outbox only by acknowledgment or rejection.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("STASH_TABLES must name at least one table")]
    NoTables,
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

fn parse_tables(raw: &str) -> Result<Vec<TableName>, ConfigError> {
    let tables: Vec<TableName> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if tables.is_empty() {
        return Err(ConfigError::NoTables);
    }
    if let Some(reserved) = tables.iter().find(|t| t.starts_with('_')) {
        return Err(ConfigError::InvalidValue {
            var: "STASH_TABLES",
            value: reserved.clone(),
        });
    }
    Ok(tables)
}
