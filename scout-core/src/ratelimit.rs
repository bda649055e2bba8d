//! Per-source token bucket rate limiting.
//!
//! Each source identifier owns an independent bucket behind its own mutex, so
//! callers hammering one source never contend with callers of another. Tokens
//! refill continuously from a monotonic clock at `rate` per second, capped at
//! `burst`. Sources that were never configured get a conservative default
//! bucket (1 call/s, burst 2) on first use.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{ConfigError, ScoutConfig};

/// Upper bound on a single sleep while waiting for a token.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimit {
    rate: f64,
    burst: f64,
}

impl RateLimit {
    /// `rate` calls per second with the default burst of `2 × rate`.
    pub fn new(rate: f64) -> Result<Self, ConfigError> {
        Self::with_burst(rate, rate * 2.0)
    }

    /// A burst below one token is raised to one so the bucket can always
    /// eventually admit a call.
    pub fn with_burst(rate: f64, burst: f64) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "rate".into(),
                value: rate.to_string(),
                reason: "rate must be a positive number of calls per second".into(),
            });
        }
        if !burst.is_finite() || burst < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "burst".into(),
                value: burst.to_string(),
                reason: "burst must be a non-negative number of tokens".into(),
            });
        }
        Ok(Self {
            rate,
            burst: burst.max(1.0),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// How long to sleep between refill checks: `min(1/rate, 100ms)`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate).min(MAX_POLL_INTERVAL)
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rate: 1.0,
            burst: 2.0,
        }
    }
}

/// Mutable state of a single source's bucket.
///
/// Invariant: `0 <= tokens <= limit.burst`.
#[derive(Debug)]
struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last_refill: Instant,
    /// Set when the limit came from configuration rather than the default.
    configured: bool,
}

impl TokenBucket {
    fn new(limit: RateLimit, configured: bool, now: Instant) -> Self {
        Self {
            limit,
            tokens: limit.burst,
            last_refill: now,
            configured,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit.rate).min(self.limit.burst);
        self.last_refill = self.last_refill.max(now);
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn reset(&mut self, now: Instant) {
        self.tokens = self.limit.burst;
        self.last_refill = now;
    }
}

type SharedBucket = Arc<Mutex<TokenBucket>>;

fn lock(bucket: &Mutex<TokenBucket>) -> MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub source: String,
    pub rate: f64,
    pub burst: f64,
    pub tokens: f64,
    pub configured: bool,
}

/// Admission control for outbound calls, one bucket per source.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, SharedBucket>,
    default_limit: RateLimit,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_default_limit(RateLimit::default())
    }

    /// Limiter whose unknown sources get `default_limit` instead of 1/s burst 2.
    pub fn with_default_limit(default_limit: RateLimit) -> Self {
        Self {
            buckets: DashMap::new(),
            default_limit,
        }
    }

    /// Limiter preloaded with the `[rate_limits]` table of a config.
    pub fn from_config(config: &ScoutConfig) -> Result<Self, ConfigError> {
        let limiter = Self::new();
        for (source, limit) in config.source_limits()? {
            limiter.set_limit(&source, limit);
        }
        Ok(limiter)
    }

    pub fn default_limit(&self) -> RateLimit {
        self.default_limit
    }

    /// Take a token for `source`, waiting as long as it takes.
    pub fn acquire(&self, source: &str) -> bool {
        self.acquire_inner(source, true, None)
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self, source: &str) -> bool {
        self.acquire_inner(source, false, None)
    }

    /// Take a token, giving up once `timeout` has elapsed.
    pub fn acquire_timeout(&self, source: &str, timeout: Duration) -> bool {
        self.acquire_inner(source, true, Some(timeout))
    }

    fn acquire_inner(&self, source: &str, blocking: bool, timeout: Option<Duration>) -> bool {
        // A timeout too large to represent as an instant means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            // Re-resolve each round so a concurrent set_limit takes effect.
            let bucket = self.bucket(source);
            let poll = {
                let mut guard = lock(&bucket);
                if guard.try_take(Instant::now()) {
                    return true;
                }
                guard.limit.poll_interval()
            };

            if !blocking {
                return false;
            }

            let mut pause = poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    debug!(source, ?timeout, "rate limit acquire timed out");
                    return false;
                }
                pause = pause.min(deadline - now);
            }
            thread::sleep(pause);
        }
    }

    /// Replace the bucket for `source`. The new bucket starts full.
    pub fn set_limit(&self, source: &str, limit: RateLimit) {
        debug!(source, rate = limit.rate, burst = limit.burst, "setting rate limit");
        self.buckets.insert(
            source.to_string(),
            Arc::new(Mutex::new(TokenBucket::new(limit, true, Instant::now()))),
        );
    }

    /// Whether `source` has a limit from `set_limit` rather than the default.
    pub fn is_configured(&self, source: &str) -> bool {
        self.buckets
            .get(source)
            .map(|bucket| {
                let configured = lock(&bucket).configured;
                configured
            })
            .unwrap_or(false)
    }

    pub fn limit(&self, source: &str) -> RateLimit {
        self.buckets
            .get(source)
            .map(|bucket| {
                let limit = lock(&bucket).limit;
                limit
            })
            .unwrap_or(self.default_limit)
    }

    /// Refill one bucket (or every bucket) to full burst immediately.
    pub fn reset(&self, source: Option<&str>) {
        let now = Instant::now();
        match source {
            Some(source) => {
                if let Some(bucket) = self.buckets.get(source) {
                    lock(&bucket).reset(now);
                }
            }
            None => {
                for bucket in self.buckets.iter() {
                    lock(bucket.value()).reset(now);
                }
            }
        }
    }

    /// Tokens currently available to `source`, if it has a bucket yet.
    pub fn available(&self, source: &str) -> Option<f64> {
        let bucket = self.buckets.get(source)?.clone();
        let mut guard = lock(&bucket);
        guard.refill(Instant::now());
        Some(guard.tokens)
    }

    /// Every known bucket, sorted by source.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let now = Instant::now();
        let mut out: Vec<BucketSnapshot> = self
            .buckets
            .iter()
            .map(|entry| {
                let mut guard = lock(entry.value());
                guard.refill(now);
                BucketSnapshot {
                    source: entry.key().clone(),
                    rate: guard.limit.rate,
                    burst: guard.limit.burst,
                    tokens: guard.tokens,
                    configured: guard.configured,
                }
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }

    fn bucket(&self, source: &str) -> SharedBucket {
        if let Some(bucket) = self.buckets.get(source) {
            return bucket.clone();
        }
        self.buckets
            .entry(source.to_string())
            .or_insert_with(|| {
                debug!(source, "creating default rate limit bucket");
                Arc::new(Mutex::new(TokenBucket::new(
                    self.default_limit,
                    false,
                    Instant::now(),
                )))
            })
            .clone()
    }
}
