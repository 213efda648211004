//! Token bucket state and refill math.

use std::time::Duration;

use parking_lot::Mutex;

use super::backend::{Quota, TakeResult};
use super::clock::saturating_nanos;

/// Number of whole intervals elapsed between `start` and `now`.
///
/// A reading earlier than `start` counts as tick zero.
pub(crate) fn tick(start: u64, now: u64, interval: u64) -> u64 {
    now.saturating_sub(start).checked_div(interval).unwrap_or(0)
}

/// Balance after refilling from `last_tick` up to `current_tick`, capped at `max_tokens`.
pub(crate) fn refilled_tokens(last_tick: u64, current_tick: u64, max_tokens: u64, fill_rate: u64) -> u64 {
    let elapsed = current_tick.saturating_sub(last_tick);
    elapsed.saturating_mul(fill_rate).min(max_tokens)
}

/// Mutable part of a bucket, guarded by the bucket's own lock.
#[derive(Debug)]
struct BucketState {
    /// Current remaining tokens
    available_tokens: u64,
    /// Last tick at which the bucket was refilled
    last_tick: u64,
}

/// A single caller's token bucket.
///
/// The refill timeline is fixed at creation: tick `n` starts at
/// `start_time + n * interval`. Crossing one or more tick boundaries refills
/// the bucket by `fill_rate` tokens per tick, so a single idle interval is
/// enough to fill it completely.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Nanoseconds since the epoch when the bucket was created
    start_time: u64,
    /// Refill ceiling
    max_tokens: u64,
    /// Tick length in nanoseconds
    interval: u64,
    /// Tokens credited per elapsed tick
    fill_rate: u64,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a full bucket whose timeline starts at `now`.
    pub(crate) fn new(max_tokens: u64, interval: Duration, now: u64) -> Self {
        let interval = saturating_nanos(interval);
        debug_assert!(interval > 0, "bucket interval must be non-zero");

        Self {
            start_time: now,
            max_tokens,
            interval,
            fill_rate: max_tokens,
            state: Mutex::new(BucketState {
                available_tokens: max_tokens,
                last_tick: 0,
            }),
        }
    }

    /// Refill if a tick boundary was crossed, then try to consume one token.
    pub(crate) fn take(&self, now: u64) -> TakeResult {
        let mut state = self.state.lock();

        let current_tick = tick(self.start_time, now, self.interval);
        if state.last_tick < current_tick {
            state.available_tokens =
                refilled_tokens(state.last_tick, current_tick, self.max_tokens, self.fill_rate);
            state.last_tick = current_tick;
        }

        let reset = self.reset_at(state.last_tick);

        if state.available_tokens > 0 {
            state.available_tokens -= 1;
            TakeResult {
                limit: self.max_tokens,
                remaining: state.available_tokens,
                reset,
                ok: true,
            }
        } else {
            TakeResult {
                limit: self.max_tokens,
                remaining: 0,
                reset,
                ok: false,
            }
        }
    }

    /// Current limit and balance, without refilling.
    pub(crate) fn quota(&self) -> Quota {
        let state = self.state.lock();
        Quota {
            limit: self.max_tokens,
            remaining: state.available_tokens,
        }
    }

    /// Add tokens on top of the current balance. The refill schedule is untouched.
    pub(crate) fn add_tokens(&self, tokens: u64) {
        let mut state = self.state.lock();
        state.available_tokens = state.available_tokens.saturating_add(tokens);
    }

    /// Start of the last tick at which the bucket was refilled.
    pub(crate) fn last_activity(&self) -> u64 {
        let state = self.state.lock();
        self.start_time
            .saturating_add(state.last_tick.saturating_mul(self.interval))
    }

    /// Absolute time of the boundary following `current_tick`.
    fn reset_at(&self, current_tick: u64) -> u64 {
        self.start_time
            .saturating_add(current_tick.saturating_add(1).saturating_mul(self.interval))
    }
}
