//! Admission decisions for request-handling layers.
//!
//! Turns one `take` into an allow / deny / error outcome plus the rate limit
//! headers to attach to the response. Nothing here depends on an HTTP
//! framework: callers map [`Decision::status`] and [`Decision::headers`] onto
//! whatever response type they use.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::ratelimit::{Storage, TakeResult};

/// Header carrying the bucket capacity.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the tokens left after this request.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the next refill instant, RFC 2822 in UTC.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Header telling a denied client how many seconds to wait.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Rate limit metadata of a single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Nanoseconds since the epoch
    pub reset: u64,
}

impl RateLimitHeaders {
    /// Reset instant as a UTC timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.reset.min(i64::MAX as u64) as i64)
    }

    /// Whole seconds from `now` until the reset, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let wait = self.reset_at().signed_duration_since(now);
        let millis = wait.num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

impl From<TakeResult> for RateLimitHeaders {
    fn from(result: TakeResult) -> Self {
        Self {
            limit: result.limit,
            remaining: result.remaining,
            reset: result.reset,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allow(RateLimitHeaders),
    /// The request must be rejected as over the limit
    Deny(RateLimitHeaders),
    /// The storage failed; the request must be rejected as a server error
    Error,
}

impl Decision {
    /// HTTP status code to answer with, or `None` when the request may proceed.
    pub fn status(&self) -> Option<u16> {
        match self {
            Decision::Allow(_) => None,
            Decision::Deny(_) => Some(429),
            Decision::Error => Some(500),
        }
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// Response headers for this decision, evaluated against `now`.
    pub fn headers_at(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let (meta, denied) = match self {
            Decision::Allow(meta) => (meta, false),
            Decision::Deny(meta) => (meta, true),
            Decision::Error => return Vec::new(),
        };

        let mut headers = vec![
            (HEADER_LIMIT, meta.limit.to_string()),
            (HEADER_REMAINING, meta.remaining.to_string()),
            (HEADER_RESET, meta.reset_at().to_rfc2822()),
        ];
        if denied {
            headers.push((HEADER_RETRY_AFTER, meta.retry_after_secs(now).to_string()));
        }
        headers
    }

    /// Response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.headers_at(Utc::now())
    }
}

/// Admission control over a storage.
pub struct Admission<S: Storage + ?Sized> {
    storage: Arc<S>,
}

impl<S: Storage + ?Sized> Clone for Admission<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage + ?Sized> Admission<S> {
    /// Create admission control backed by `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Take one token for `key` and decide whether the request may proceed.
    pub async fn check(&self, key: &str) -> Decision {
        match self.storage.take(key).await {
            Ok(result) if result.ok => Decision::Allow(result.into()),
            Ok(result) => Decision::Deny(result.into()),
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit storage failed");
                Decision::Error
            }
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}
