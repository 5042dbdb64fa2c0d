use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the siftd filter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// TCP address the line listener binds to. Default: "0.0.0.0:2003".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to the retention rules file. Required.
    #[serde(default)]
    pub retention_config: String,

    /// Log dropped unparseable lines at debug level. Default: false.
    #[serde(default)]
    pub log_parse_errors: bool,

    /// Redis store connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// How often the pattern index is rebuilt. Default: 1s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Maximum time between batch flushes. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// How often hot-path counters are folded into the registry. Default: 1s.
    #[serde(default = "default_counter_flush_interval", with = "humantime_serde")]
    pub counter_flush_interval: Duration,

    /// How often the store heartbeat is considered. Default: 5s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Number of points that triggers an early batch flush. Default: 10.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bounded capacity of the reader-to-batcher channel. Default: 10.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Redis store connection configuration.
#[derive(Debug, Deserialize)]
pub struct RedisConfig {
    /// Redis address (host:port). Default: "127.0.0.1:6379".
    #[serde(default = "default_redis_endpoint")]
    pub endpoint: String,

    /// Logical database index. Default: 0.
    #[serde(default)]
    pub db: i64,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Listen address. Empty disables the server. Default: ":9090".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:2003".to_string()
}

fn default_redis_endpoint() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_metrics_addr() -> String {
    ":9090".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_counter_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_batch_size() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    10
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            retention_config: String::new(),
            log_parse_errors: false,
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
            refresh_interval: default_refresh_interval(),
            flush_interval: default_flush_interval(),
            counter_flush_interval: default_counter_flush_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_redis_endpoint(),
            db: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            bail!("listen address is required");
        }

        if self.retention_config.is_empty() {
            bail!("retention_config path is required");
        }

        if self.redis.endpoint.is_empty() {
            bail!("redis.endpoint is required");
        }

        if self.redis.db < 0 {
            bail!("redis.db must not be negative");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }

        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        Ok(())
    }
}
