//! Storage trait shared by the in-process and Redis backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Outcome of a single `take`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TakeResult {
    /// Bucket capacity
    pub limit: u64,
    /// Tokens left after this call
    pub remaining: u64,
    /// Nanoseconds since the epoch at which the next interval starts
    pub reset: u64,
    /// Whether a token was consumed. When `false` the caller must not proceed.
    pub ok: bool,
}

/// Limit and balance of a bucket as currently stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Quota {
    /// Bucket capacity
    pub limit: u64,
    /// Tokens currently available
    pub remaining: u64,
}

/// Trait for token bucket storages.
///
/// Every operation on a stopped storage fails with
/// [`StorageError::Stopped`](crate::error::StorageError::Stopped).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Take one token for `key`, creating its bucket on first use.
    async fn take(&self, key: &str) -> Result<TakeResult>;

    /// Current limit and remaining tokens for `key`.
    ///
    /// Returns zeros for an unknown key and never creates one.
    async fn get(&self, key: &str) -> Result<Quota>;

    /// Replace the bucket for `key` with a full one of the given size.
    async fn set(&self, key: &str, tokens: u64, interval: Duration) -> Result<()>;

    /// Add `tokens` to the current balance of `key` until the next refill.
    ///
    /// An unknown key gets a bucket sized to the configured tokens plus `tokens`.
    async fn burst(&self, key: &str, tokens: u64) -> Result<()>;

    /// Stop the storage and release its resources.
    async fn close(&self) -> Result<()>;
}
