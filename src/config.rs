//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;

/// Prefix of environment variables overriding file settings, e.g.
/// `TOLLGATE__LIMITS__TOKENS=100`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Which storage backend to build
    #[serde(default)]
    pub backend: BackendKind,

    /// Default bucket size for keys seen for the first time
    #[serde(default)]
    pub limits: LimitsConfig,

    /// In-process storage settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Redis storage settings
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Default limits applied to keys without an explicit `set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Tokens allowed per interval
    #[serde(default = "default_tokens")]
    pub tokens: u64,

    /// Interval length in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tokens: default_tokens(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl LimitsConfig {
    /// Create limits of `tokens` per `interval`.
    pub fn new(tokens: u64, interval: Duration) -> Self {
        Self {
            tokens,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Tokens per interval; zero falls back to the default.
    pub fn tokens(&self) -> u64 {
        if self.tokens > 0 {
            self.tokens
        } else {
            default_tokens()
        }
    }

    /// Interval length; zero falls back to the default.
    pub fn interval(&self) -> Duration {
        if self.interval_ms > 0 {
            Duration::from_millis(self.interval_ms)
        } else {
            Duration::from_millis(default_interval_ms())
        }
    }
}

fn default_tokens() -> u64 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

/// In-process storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// How often idle buckets are swept, in milliseconds. Lower values evict
    /// sooner but hold the registry write lock more often.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Minimum idle time before a bucket may be evicted, in milliseconds
    #[serde(default = "default_sweep_min_ttl_ms")]
    pub sweep_min_ttl_ms: u64,

    /// Initial registry capacity
    #[serde(default = "default_init_alloc")]
    pub init_alloc: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            sweep_min_ttl_ms: default_sweep_min_ttl_ms(),
            init_alloc: default_init_alloc(),
        }
    }
}

impl MemoryConfig {
    /// Sweep period; zero falls back to the default.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(non_zero_or(self.sweep_interval_ms, default_sweep_interval_ms()))
    }

    /// Idle threshold for eviction; zero falls back to the default.
    pub fn sweep_min_ttl(&self) -> Duration {
        Duration::from_millis(non_zero_or(self.sweep_min_ttl_ms, default_sweep_min_ttl_ms()))
    }

    /// Initial registry capacity; zero falls back to the default.
    pub fn init_alloc(&self) -> usize {
        if self.init_alloc > 0 {
            self.init_alloc
        } else {
            default_init_alloc()
        }
    }
}

fn default_sweep_interval_ms() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_sweep_min_ttl_ms() -> u64 {
    12 * 60 * 60 * 1000
}

fn default_init_alloc() -> usize {
    4096
}

/// Redis storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Pool size; bounds concurrent in-flight operations
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Deadline for a single storage operation, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_connections: default_max_connections(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Operation deadline; zero falls back to the default.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(non_zero_or(self.timeout_ms, default_timeout_ms()))
    }

    /// Pool size; zero falls back to the default.
    pub fn max_connections(&self) -> usize {
        if self.max_connections > 0 {
            self.max_connections
        } else {
            default_max_connections()
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_connections() -> usize {
    16
}

fn default_timeout_ms() -> u64 {
    5000
}

fn non_zero_or(value: u64, default: u64) -> u64 {
    if value > 0 {
        value
    } else {
        default
    }
}

impl TollgateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, overridden by `TOLLGATE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
