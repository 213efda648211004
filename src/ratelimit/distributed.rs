//! Redis-backed token bucket storage.
//!
//! Buckets are stored as Redis hashes, one per key. A `take` runs the whole
//! refill-and-consume step as a single Lua script so concurrent callers on
//! different hosts never interleave on the same key.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolConfig, Runtime, Timeouts};
use redis::Script;
use tracing::{debug, info, trace};

use super::backend::{Quota, Storage, TakeResult};
use super::clock::{interval_nanos, saturating_nanos, Clock, SystemClock};
use crate::config::{LimitsConfig, RedisConfig};
use crate::error::{Result, StorageError};

const FIELD_START: &str = "s";
const FIELD_LAST_TICK: &str = "t";
const FIELD_INTERVAL: &str = "i";
const FIELD_MAX_TOKENS: &str = "m";
const FIELD_AVAILABLE: &str = "a";

/// Expiration applied by `set` and `burst`. `take` sets its own, derived from the interval.
const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const TAKE_SCRIPT: &str = include_str!("take.lua");

/// A token bucket storage shared through Redis.
pub struct RedisStorage {
    /// Default capacity for keys seen for the first time
    tokens: u64,
    /// Default interval for keys seen for the first time
    interval: Duration,
    /// Deadline for a single operation
    timeout: Duration,
    pool: Pool,
    script: Script,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("tokens", &self.tokens)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("pool", &self.pool.status())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisStorage {
    /// Create a storage with its own connection pool.
    ///
    /// No connection is opened until the first operation.
    pub fn new(limits: &LimitsConfig, config: &RedisConfig) -> Result<Self> {
        Self::with_clock(limits, config, Arc::new(SystemClock))
    }

    /// Create a storage with its own connection pool, reading time from `clock`.
    pub fn with_clock(limits: &LimitsConfig, config: &RedisConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let timeout = config.timeout();

        let mut timeouts = Timeouts::new();
        timeouts.wait = Some(timeout);
        timeouts.create = Some(timeout);
        timeouts.recycle = Some(timeout);

        let mut pool_config = PoolConfig::new(config.max_connections());
        pool_config.timeouts = timeouts;

        let mut redis_config = deadpool_redis::Config::from_url(config.url.clone());
        redis_config.pool = Some(pool_config);
        let pool = redis_config.create_pool(Some(Runtime::Tokio1))?;

        info!(
            max_connections = config.max_connections(),
            timeout = ?timeout,
            "Redis connection pool created"
        );

        Ok(Self::with_pool(limits, pool, timeout, clock))
    }

    /// Create a storage over an existing pool.
    pub fn with_pool(limits: &LimitsConfig, pool: Pool, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        info!(
            tokens = limits.tokens(),
            interval = ?limits.interval(),
            "Redis storage started"
        );

        Self {
            tokens: limits.tokens(),
            interval: limits.interval(),
            timeout,
            pool,
            script: Script::new(TAKE_SCRIPT),
            clock,
            stopped: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(StorageError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Run `op` under the configured deadline.
    async fn with_deadline<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))?
    }

    /// Take one token for `key`, creating its record on first use.
    pub async fn take(&self, key: &str) -> Result<TakeResult> {
        self.ensure_running()?;
        let now = self.clock.now_nanos();

        let reply: Vec<u64> = self
            .with_deadline(async {
                let mut conn = self.pool.get().await?;
                let reply: Vec<u64> = self
                    .script
                    .key(key)
                    .arg(now)
                    .arg(self.tokens)
                    .arg(saturating_nanos(self.interval))
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, StorageError>(reply)
            })
            .await?;

        let result = parse_take_reply(&reply)?;

        trace!(
            key = %key,
            ok = result.ok,
            remaining = result.remaining,
            reset = result.reset,
            "Take"
        );
        if !result.ok {
            debug!(key = %key, limit = result.limit, "Rate limit exceeded");
        }

        Ok(result)
    }

    /// Current limit and remaining tokens for `key`; zeros if it is unknown.
    pub async fn get(&self, key: &str) -> Result<Quota> {
        self.ensure_running()?;

        let reply: Vec<Option<u64>> = self
            .with_deadline(async {
                let mut conn = self.pool.get().await?;
                let reply: Vec<Option<u64>> = redis::cmd("HMGET")
                    .arg(key)
                    .arg(FIELD_MAX_TOKENS)
                    .arg(FIELD_AVAILABLE)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, StorageError>(reply)
            })
            .await?;

        parse_quota_reply(&reply)
    }

    /// Overwrite the record for `key` with a full bucket of the given size.
    pub async fn set(&self, key: &str, tokens: u64, interval: Duration) -> Result<()> {
        self.ensure_running()?;
        let interval_ns = interval_nanos(interval)?;
        let now = self.clock.now_nanos();

        self.with_deadline(async {
            let mut conn = self.pool.get().await?;
            let () = redis::pipe()
                .atomic()
                .hset_multiple(
                    key,
                    &[
                        (FIELD_START, now),
                        (FIELD_LAST_TICK, 0),
                        (FIELD_INTERVAL, interval_ns),
                        (FIELD_MAX_TOKENS, tokens),
                        (FIELD_AVAILABLE, tokens),
                    ],
                )
                .ignore()
                .expire(key, RECORD_TTL.as_secs() as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, StorageError>(())
        })
        .await?;

        debug!(key = %key, limit = tokens, interval = ?interval, "Bucket set");
        Ok(())
    }

    /// Add `tokens` to the stored balance of `key`.
    ///
    /// This bypasses the refill script: the tick and interval of an existing
    /// record are left as they are. A missing record is created with the
    /// default interval and a capacity of the default tokens plus `tokens`.
    pub async fn burst(&self, key: &str, tokens: u64) -> Result<()> {
        self.ensure_running()?;
        let now = self.clock.now_nanos();

        self.with_deadline(async {
            let mut conn = self.pool.get().await?;
            let () = redis::pipe()
                .atomic()
                .hset_nx(key, FIELD_START, now)
                .ignore()
                .hset_nx(key, FIELD_LAST_TICK, 0)
                .ignore()
                .hset_nx(key, FIELD_INTERVAL, saturating_nanos(self.interval))
                .ignore()
                .hset_nx(key, FIELD_MAX_TOKENS, self.tokens.saturating_add(tokens))
                .ignore()
                .hset_nx(key, FIELD_AVAILABLE, self.tokens)
                .ignore()
                .hincr(key, FIELD_AVAILABLE, tokens)
                .ignore()
                .expire(key, RECORD_TTL.as_secs() as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, StorageError>(())
        })
        .await?;

        debug!(key = %key, tokens = tokens, "Burst added to bucket");
        Ok(())
    }

    /// Stop the storage and close the pool. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.pool.close();
        info!("Redis storage stopped");
        Ok(())
    }
}

/// Decode the `[max tokens, remaining, reset, taken]` script reply.
fn parse_take_reply(reply: &[u64]) -> Result<TakeResult> {
    match *reply {
        [limit, remaining, reset, taken] => Ok(TakeResult {
            limit,
            remaining,
            reset,
            ok: taken == 1,
        }),
        _ => Err(StorageError::UnexpectedReply {
            command: "take",
            expected: 4,
            actual: reply.len(),
        }),
    }
}

/// Decode the `HMGET m a` reply. Missing fields read as zero.
fn parse_quota_reply(reply: &[Option<u64>]) -> Result<Quota> {
    match *reply {
        [limit, remaining] => Ok(Quota {
            limit: limit.unwrap_or(0),
            remaining: remaining.unwrap_or(0),
        }),
        _ => Err(StorageError::UnexpectedReply {
            command: "HMGET",
            expected: 2,
            actual: reply.len(),
        }),
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn take(&self, key: &str) -> Result<TakeResult> {
        RedisStorage::take(self, key).await
    }

    async fn get(&self, key: &str) -> Result<Quota> {
        RedisStorage::get(self, key).await
    }

    async fn set(&self, key: &str, tokens: u64, interval: Duration) -> Result<()> {
        RedisStorage::set(self, key, tokens, interval).await
    }

    async fn burst(&self, key: &str, tokens: u64) -> Result<()> {
        RedisStorage::burst(self, key, tokens).await
    }

    async fn close(&self) -> Result<()> {
        RedisStorage::close(self).await
    }
}
