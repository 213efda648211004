//! In-process token bucket storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::backend::{Quota, Storage, TakeResult};
use super::bucket::Bucket;
use super::clock::{interval_nanos, saturating_nanos, Clock, SystemClock};
use crate::config::{LimitsConfig, MemoryConfig};
use crate::error::{Result, StorageError};

type Registry = RwLock<HashMap<String, Arc<Bucket>>>;

/// Token bucket storage kept in process memory.
///
/// Buckets live in a registry guarded by a read-write lock, while each bucket
/// guards its own balance. The registry lock is never held while a bucket is
/// being refilled or drained, so unrelated keys do not serialize behind each
/// other. A background task evicts buckets that have been idle for longer than
/// the configured minimum TTL.
pub struct MemoryStorage {
    /// Default capacity for keys seen for the first time
    tokens: u64,
    /// Default interval for keys seen for the first time
    interval: Duration,
    clock: Arc<dyn Clock>,
    buckets: Arc<Registry>,
    stopped: AtomicBool,
    /// Flipped to `true` on close. Dropping it also stops the sweeper.
    stop_tx: watch::Sender<bool>,
}

impl MemoryStorage {
    /// Create a storage using the system clock and start its sweeper.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(limits: &LimitsConfig, config: &MemoryConfig) -> Self {
        Self::with_clock(limits, config, Arc::new(SystemClock))
    }

    /// Create a storage reading time from `clock` and start its sweeper.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn with_clock(limits: &LimitsConfig, config: &MemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let buckets: Arc<Registry> = Arc::new(RwLock::new(HashMap::with_capacity(config.init_alloc())));
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(sweep_loop(
            Arc::clone(&buckets),
            Arc::clone(&clock),
            config.sweep_interval(),
            config.sweep_min_ttl(),
            stop_rx,
        ));

        info!(
            tokens = limits.tokens(),
            interval = ?limits.interval(),
            sweep_interval = ?config.sweep_interval(),
            sweep_min_ttl = ?config.sweep_min_ttl(),
            "Memory storage started"
        );

        Self {
            tokens: limits.tokens(),
            interval: limits.interval(),
            clock,
            buckets,
            stopped: AtomicBool::new(false),
            stop_tx,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(StorageError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Take one token for `key`, creating its bucket on first use.
    pub fn take(&self, key: &str) -> Result<TakeResult> {
        self.ensure_running()?;
        let now = self.clock.now_nanos();

        // Fast path: the read guard is a temporary and is released before the
        // bucket lock is taken.
        let existing = self.buckets.read().get(key).cloned();

        let bucket = match existing {
            Some(bucket) => bucket,
            None => {
                let mut buckets = self.buckets.write();
                // Another caller may have created the bucket between the two locks.
                let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
                    debug!(key = %key, limit = self.tokens, interval = ?self.interval, "Creating bucket");
                    Arc::new(Bucket::new(self.tokens, self.interval, now))
                });
                Arc::clone(bucket)
            }
        };

        let result = bucket.take(now);

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
    pub fn get(&self, key: &str) -> Result<Quota> {
        self.ensure_running()?;

        let existing = self.buckets.read().get(key).cloned();
        Ok(existing.map(|bucket| bucket.quota()).unwrap_or_default())
    }

    /// Install a fresh, full bucket for `key`.
    pub fn set(&self, key: &str, tokens: u64, interval: Duration) -> Result<()> {
        self.ensure_running()?;
        interval_nanos(interval)?;

        let bucket = Arc::new(Bucket::new(tokens, interval, self.clock.now_nanos()));
        self.buckets.write().insert(key.to_string(), bucket);

        debug!(key = %key, limit = tokens, interval = ?interval, "Bucket set");
        Ok(())
    }

    /// Add `tokens` to the balance of `key`.
    pub fn burst(&self, key: &str, tokens: u64) -> Result<()> {
        self.ensure_running()?;

        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get(key).cloned() {
            drop(buckets);
            bucket.add_tokens(tokens);
            debug!(key = %key, tokens = tokens, "Burst added to bucket");
            return Ok(());
        }

        let limit = self.tokens.saturating_add(tokens);
        buckets.insert(
            key.to_string(),
            Arc::new(Bucket::new(limit, self.interval, self.clock.now_nanos())),
        );
        debug!(key = %key, limit = limit, "Burst created bucket");
        Ok(())
    }

    /// Stop the sweeper and drop every bucket.
    ///
    /// Closing twice returns [`StorageError::AlreadyStopped`].
    pub fn close(&self) -> Result<()> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StorageError::AlreadyStopped);
        }

        // The sweeper may already be gone if the runtime shut down.
        let _ = self.stop_tx.send(true);
        self.buckets.write().clear();

        info!("Memory storage stopped");
        Ok(())
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Whether no buckets are held.
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}

/// Periodically evict idle buckets until stopped.
async fn sweep_loop(
    buckets: Arc<Registry>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    min_ttl: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + sweep_interval;
    let mut ticker = tokio::time::interval_at(start, sweep_interval);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    trace!("Sweeper stopped");
                    return;
                }
            }
            _ = ticker.tick() => {
                let removed = purge_idle(&buckets, clock.now_nanos(), min_ttl);
                if removed > 0 {
                    info!(removed = removed, "Swept idle buckets");
                }
            }
        }
    }
}

/// Remove buckets whose last refill is older than `min_ttl`.
///
/// Holds the registry write lock for the whole pass.
fn purge_idle(buckets: &Registry, now: u64, min_ttl: Duration) -> usize {
    let min_ttl = saturating_nanos(min_ttl);
    let mut buckets = buckets.write();
    let before = buckets.len();

    buckets.retain(|_, bucket| now.saturating_sub(bucket.last_activity()) <= min_ttl);

    before - buckets.len()
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn take(&self, key: &str) -> Result<TakeResult> {
        MemoryStorage::take(self, key)
    }

    async fn get(&self, key: &str) -> Result<Quota> {
        MemoryStorage::get(self, key)
    }

    async fn set(&self, key: &str, tokens: u64, interval: Duration) -> Result<()> {
        MemoryStorage::set(self, key, tokens, interval)
    }

    async fn burst(&self, key: &str, tokens: u64) -> Result<()> {
        MemoryStorage::burst(self, key, tokens)
    }

    async fn close(&self) -> Result<()> {
        MemoryStorage::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const START: u64 = 1_700_000_000_000_000_000;

    fn test_storage(tokens: u64, interval: Duration) -> (MemoryStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let storage = MemoryStorage::with_clock(
            &LimitsConfig::new(tokens, interval),
            &MemoryConfig::default(),
            clock.clone(),
        );
        (storage, clock)
    }

    #[tokio::test]
    async fn test_take_creates_bucket() {
        let (storage, _clock) = test_storage(10, Duration::from_secs(1));
        assert!(storage.is_empty());

        let result = storage.take("key").unwrap();
        assert!(result.ok);
        assert_eq!(result.limit, 10);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.reset, START + 1_000_000_000);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_take_exhausts_then_refills() {
        let (storage, clock) = test_storage(3, Duration::from_secs(1));

        for expected in [2, 1, 0] {
            let result = storage.take("key").unwrap();
            assert!(result.ok);
            assert_eq!(result.remaining, expected);
        }

        let denied = storage.take("key").unwrap();
        assert!(!denied.ok);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);

        clock.advance(Duration::from_secs(1));
        assert_eq!(storage.get("key").unwrap(), Quota { limit: 3, remaining: 0 });

        let result = storage.take("key").unwrap();
        assert!(result.ok);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_is_monotonic() {
        let (storage, clock) = test_storage(1, Duration::from_millis(100));

        let mut last_reset = 0;
        for _ in 0..10 {
            let result = storage.take("key").unwrap();
            assert!(result.reset >= last_reset);
            last_reset = result.reset;
            clock.advance(Duration::from_millis(35));
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (storage, _clock) = test_storage(1, Duration::from_secs(1));

        assert!(storage.take("a").unwrap().ok);
        assert!(!storage.take("a").unwrap().ok);
        assert!(storage.take("b").unwrap().ok);
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_get_unknown_key_does_not_create() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));

        assert_eq!(storage.get("missing").unwrap(), Quota::default());
        assert_eq!(storage.get("missing").unwrap(), Quota::default());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));
        storage.take("key").unwrap();

        storage.set("key", 42, Duration::from_secs(60)).unwrap();
        assert_eq!(storage.get("key").unwrap(), Quota { limit: 42, remaining: 42 });
    }

    #[tokio::test]
    async fn test_set_uses_new_interval() {
        let (storage, clock) = test_storage(5, Duration::from_secs(1));
        storage.set("key", 1, Duration::from_secs(10)).unwrap();

        let first = storage.take("key").unwrap();
        assert!(first.ok);
        assert_eq!(first.reset, START + 10_000_000_000);

        clock.advance(Duration::from_secs(1));
        assert!(!storage.take("key").unwrap().ok);
    }

    #[tokio::test]
    async fn test_set_rejects_zero_interval() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));
        assert!(matches!(
            storage.set("key", 1, Duration::ZERO),
            Err(StorageError::InvalidInterval)
        ));
    }

    #[tokio::test]
    async fn test_set_rejects_interval_beyond_u64_nanos() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));
        storage.take("key").unwrap();

        assert!(matches!(
            storage.set("key", 1, Duration::from_secs(1 << 55)),
            Err(StorageError::InvalidInterval)
        ));
        // the existing bucket is untouched
        assert_eq!(storage.get("key").unwrap(), Quota { limit: 5, remaining: 4 });
    }

    #[tokio::test]
    async fn test_burst_existing_bucket() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));
        storage.take("key").unwrap();
        storage.take("key").unwrap();

        storage.burst("key", 10).unwrap();
        let result = storage.take("key").unwrap();
        assert!(result.ok);
        assert_eq!(result.remaining, 3 + 10 - 1);
        assert_eq!(result.limit, 5);
    }

    #[tokio::test]
    async fn test_burst_unknown_key_inflates_capacity() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));

        storage.burst("key", 3).unwrap();
        assert_eq!(storage.get("key").unwrap(), Quota { limit: 8, remaining: 8 });
    }

    #[tokio::test]
    async fn test_close_stops_storage() {
        let (storage, _clock) = test_storage(5, Duration::from_secs(1));
        storage.take("key").unwrap();

        storage.close().unwrap();
        assert!(storage.is_empty());

        assert!(matches!(storage.take("key"), Err(StorageError::Stopped)));
        assert!(matches!(storage.get("key"), Err(StorageError::Stopped)));
        assert!(matches!(
            storage.set("key", 1, Duration::from_secs(1)),
            Err(StorageError::Stopped)
        ));
        assert!(matches!(storage.burst("key", 1), Err(StorageError::Stopped)));
        assert!(matches!(storage.close(), Err(StorageError::AlreadyStopped)));
        assert!(storage.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takes_on_new_key() {
        let tokens = 10u64;
        let (storage, _clock) = test_storage(tokens, Duration::from_secs(1));
        let storage = Arc::new(storage);

        let handles: Vec<_> = (0..2 * tokens)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move { storage.take("shared").unwrap() })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let mut remaining: Vec<u64> = results.iter().filter(|r| r.ok).map(|r| r.remaining).collect();
        remaining.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(remaining, (0..tokens).rev().collect::<Vec<_>>());

        let denied: Vec<_> = results.iter().filter(|r| !r.ok).collect();
        assert_eq!(denied.len() as u64, tokens);
        assert!(denied.iter().all(|r| r.remaining == 0 && r.limit == tokens));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_purge_idle() {
        let registry: Registry = RwLock::new(HashMap::new());
        let second = 1_000_000_000;
        registry
            .write()
            .insert("old".to_string(), Arc::new(Bucket::new(1, Duration::from_secs(1), 0)));
        registry
            .write()
            .insert("new".to_string(), Arc::new(Bucket::new(1, Duration::from_secs(1), 50 * second)));

        let removed = purge_idle(&registry, 60 * second, Duration::from_secs(30));
        assert_eq!(removed, 1);
        assert!(registry.read().contains_key("new"));
        assert!(!registry.read().contains_key("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_buckets() {
        let clock = Arc::new(ManualClock::new(START));
        let storage = MemoryStorage::with_clock(
            &LimitsConfig::new(2, Duration::from_secs(1)),
            &MemoryConfig {
                sweep_interval_ms: 10,
                sweep_min_ttl_ms: 5_000,
                init_alloc: 16,
            },
            clock.clone(),
        );

        storage.take("idle").unwrap();
        storage.take("idle").unwrap();
        assert!(!storage.take("idle").unwrap().ok);

        clock.advance(Duration::from_secs(3));
        storage.take("busy").unwrap();

        // idle for 3s: below the TTL, kept
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.len(), 2);

        clock.advance(Duration::from_secs(3));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("idle").unwrap(), Quota::default());

        // evicted keys start over with a full bucket
        let result = storage.take("idle").unwrap();
        assert!(result.ok);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.reset, clock.now_nanos() + 1_000_000_000);

        storage.close().unwrap();
    }
}
