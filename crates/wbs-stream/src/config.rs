//! Engine configuration management.

use crate::error::SyncError;
use crate::naming::DEFAULT_STREAM_PREFIX;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u64 = 3;
pub const DEFAULT_MAX_RETENTION: Duration = Duration::from_millis(120_000);
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(30_000);
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(1_000);
pub const DEFAULT_READ_BATCH_SIZE: usize = 100;

/// Retry policy applied by the pending reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Attempts before an entry is routed to the dead-letter stream.
    pub max_attempts: u64,
    /// Age bound for pending entries; also the attempt counter TTL.
    pub max_retention: Duration,
    /// Pending entries examined per sweep.
    pub batch_size: usize,
    /// Delay between the end of one sweep and the start of the next.
    pub sweep_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_retention: DEFAULT_MAX_RETENTION,
            batch_size: DEFAULT_BATCH_SIZE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Settings for the live receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// How long a read waits for new entries.
    pub block_timeout: Duration,
    /// Maximum entries returned by one read.
    pub read_batch_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
        }
    }
}

/// Write-behind engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbsConfig {
    /// Prefix of every entity stream key.
    pub stream_prefix: String,
    pub reconciler: ReconcilerConfig,
    pub consumer: ConsumerConfig,
}

impl Default for WbsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            reconciler: ReconcilerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl WbsConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional:
    /// - `WBS_STREAM_PREFIX`: stream key prefix (default: "wb:stream:entity")
    /// - `WBS_PEL_MAX_ATTEMPTS`: retry budget (default: 3)
    /// - `WBS_PEL_MAX_RETENTION_MS`: age budget and counter TTL (default: 120000)
    /// - `WBS_PEL_BATCH_SIZE`: pending entries per sweep (default: 50)
    /// - `WBS_PEL_SWEEP_INTERVAL_MS`: sweep period (default: 30000)
    /// - `WBS_CONSUMER_BLOCK_MS`: receive block timeout (default: 1000)
    /// - `WBS_CONSUMER_BATCH_SIZE`: entries per receive (default: 100)
    pub fn from_env() -> Result<Self, SyncError> {
        let mut builder = Self::builder();

        if let Ok(prefix) = env::var("WBS_STREAM_PREFIX") {
            builder = builder.stream_prefix(prefix);
        }
        if let Some(v) = parse_var::<u64>("WBS_PEL_MAX_ATTEMPTS")? {
            builder = builder.max_attempts(v);
        }
        if let Some(v) = parse_var::<u64>("WBS_PEL_MAX_RETENTION_MS")? {
            builder = builder.max_retention(Duration::from_millis(v));
        }
        if let Some(v) = parse_var::<usize>("WBS_PEL_BATCH_SIZE")? {
            builder = builder.batch_size(v);
        }
        if let Some(v) = parse_var::<u64>("WBS_PEL_SWEEP_INTERVAL_MS")? {
            builder = builder.sweep_interval(Duration::from_millis(v));
        }
        if let Some(v) = parse_var::<u64>("WBS_CONSUMER_BLOCK_MS")? {
            builder = builder.block_timeout(Duration::from_millis(v));
        }
        if let Some(v) = parse_var::<usize>("WBS_CONSUMER_BATCH_SIZE")? {
            builder = builder.read_batch_size(v);
        }

        builder.build()
    }

    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> WbsConfigBuilder {
        WbsConfigBuilder::new()
    }
}

fn parse_var<T: FromStr>(var: &str) -> Result<Option<T>, SyncError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::ConfigInvalid {
                var: var.to_string(),
                reason: format!("Not a valid number: {raw}"),
            }),
        Err(_) => Ok(None),
    }
}

/// Builder for `WbsConfig`.
#[derive(Debug, Default)]
pub struct WbsConfigBuilder {
    stream_prefix: Option<String>,
    max_attempts: Option<u64>,
    max_retention: Option<Duration>,
    batch_size: Option<usize>,
    sweep_interval: Option<Duration>,
    block_timeout: Option<Duration>,
    read_batch_size: Option<usize>,
}

impl WbsConfigBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stream key prefix.
    pub fn stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = Some(prefix.into());
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the age budget and attempt counter TTL.
    #[must_use]
    pub fn max_retention(mut self, retention: Duration) -> Self {
        self.max_retention = Some(retention);
        self
    }

    /// Set the number of pending entries examined per sweep.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the sweep period.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the receive block timeout.
    #[must_use]
    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    /// Set the number of entries returned by one receive.
    #[must_use]
    pub fn read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = Some(size);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<WbsConfig, SyncError> {
        let stream_prefix = self
            .stream_prefix
            .unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string());
        if stream_prefix.trim().is_empty() {
            return Err(SyncError::ConfigInvalid {
                var: "stream_prefix".to_string(),
                reason: "Prefix cannot be empty".to_string(),
            });
        }

        let reconciler = ReconcilerConfig {
            max_attempts: positive("max_attempts", self.max_attempts, DEFAULT_MAX_ATTEMPTS)?,
            max_retention: non_zero("max_retention", self.max_retention, DEFAULT_MAX_RETENTION)?,
            batch_size: positive("batch_size", self.batch_size, DEFAULT_BATCH_SIZE)?,
            sweep_interval: non_zero(
                "sweep_interval",
                self.sweep_interval,
                DEFAULT_SWEEP_INTERVAL,
            )?,
        };

        let consumer = ConsumerConfig {
            block_timeout: non_zero("block_timeout", self.block_timeout, DEFAULT_BLOCK_TIMEOUT)?,
            read_batch_size: positive(
                "read_batch_size",
                self.read_batch_size,
                DEFAULT_READ_BATCH_SIZE,
            )?,
        };

        Ok(WbsConfig {
            stream_prefix,
            reconciler,
            consumer,
        })
    }
}

fn positive<T>(var: &str, value: Option<T>, default: T) -> Result<T, SyncError>
where
    T: PartialEq + Default,
{
    let value = value.unwrap_or(default);
    if value == T::default() {
        return Err(SyncError::ConfigInvalid {
            var: var.to_string(),
            reason: "Must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn non_zero(var: &str, value: Option<Duration>, default: Duration) -> Result<Duration, SyncError> {
    let value = value.unwrap_or(default);
    if value.is_zero() {
        return Err(SyncError::ConfigInvalid {
            var: var.to_string(),
            reason: "Duration must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = WbsConfig::builder().build().unwrap();

        assert_eq!(config, WbsConfig::default());
        assert_eq!(config.reconciler.max_attempts, 3);
        assert_eq!(config.reconciler.max_retention, Duration::from_millis(120_000));
        assert_eq!(config.reconciler.batch_size, 50);
        assert_eq!(config.reconciler.sweep_interval, Duration::from_millis(30_000));
        assert_eq!(config.stream_prefix, "wb:stream:entity");
    }

    #[test]
    fn test_builder_overrides() {
        let config = WbsConfig::builder()
            .stream_prefix("app:stream")
            .max_attempts(5)
            .max_retention(Duration::from_secs(10))
            .batch_size(10)
            .sweep_interval(Duration::from_secs(5))
            .block_timeout(Duration::from_millis(250))
            .read_batch_size(20)
            .build()
            .unwrap();

        assert_eq!(config.stream_prefix, "app:stream");
        assert_eq!(config.reconciler.max_attempts, 5);
        assert_eq!(config.reconciler.batch_size, 10);
        assert_eq!(config.consumer.block_timeout, Duration::from_millis(250));
        assert_eq!(config.consumer.read_batch_size, 20);
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let result = WbsConfig::builder().max_attempts(0).build();
        if let Err(SyncError::ConfigInvalid { var, .. }) = result {
            assert_eq!(var, "max_attempts");
        } else {
            panic!("Expected ConfigInvalid error");
        }
    }

    #[test]
    fn test_builder_rejects_zero_durations() {
        assert!(WbsConfig::builder()
            .sweep_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(WbsConfig::builder()
            .max_retention(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_empty_prefix() {
        assert!(WbsConfig::builder().stream_prefix("  ").build().is_err());
    }

    #[test]
    fn test_from_env_invalid_number() {
        env::set_var("WBS_PEL_BATCH_SIZE", "many");
        let result = WbsConfig::from_env();
        env::remove_var("WBS_PEL_BATCH_SIZE");

        assert!(matches!(
            result,
            Err(SyncError::ConfigInvalid { ref var, .. }) if var == "WBS_PEL_BATCH_SIZE"
        ));
    }
}
