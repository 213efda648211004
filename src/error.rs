//! Error types for Tollgate storages.

use std::time::Duration;

use thiserror::Error;

/// Main error type for rate limit storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The storage was closed; no further operations are accepted
    #[error("store is stopped")]
    Stopped,

    /// `close` was called on a storage that is already stopped
    #[error("store is already stopped")]
    AlreadyStopped,

    /// A bucket interval must be non-zero and fit in 64 bits of nanoseconds
    #[error("interval must be greater than zero and at most u64::MAX nanoseconds")]
    InvalidInterval,

    /// Failed to check a connection out of the pool
    #[error("failed to get connection from pool: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Failed to build the connection pool
    #[error("failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    /// A command or script failed on the server
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The server replied with the wrong number of elements
    #[error("{command}: expected {expected} values in reply, got {actual}")]
    UnexpectedReply {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The operation did not finish before its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Layered configuration loading failed
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// YAML parsing failed
    #[error("Configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
