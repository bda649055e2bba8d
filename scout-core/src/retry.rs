//! Retry with exponential backoff.
//!
//! Attempt `n` that fails with a retryable error is followed by a sleep of
//! `base_backoff × 2^(n-1)` before attempt `n + 1`. The last error is handed
//! back unchanged once the attempt budget is spent; non-retryable errors are
//! returned immediately.

use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that know whether a repeat attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    /// Three attempts, 500 ms base delay.
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; zero is treated as one.
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff: None,
        }
    }

    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Cap every individual backoff at `cap`.
    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    /// Sleep that follows failed attempt number `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_backoff.saturating_mul(1u32 << exponent);
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Run `op`, retrying errors that report themselves as retryable.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Result<T, E>,
    {
        self.run_if(|e: &E| e.is_retryable(), op)
    }

    /// Run `op`, retrying errors for which `classify` returns true.
    pub fn run_if<T, E, C, F>(&self, mut classify: C, mut op: F) -> Result<T, E>
    where
        E: Display,
        C: FnMut(&E) -> bool,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !classify(&err) => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    warn!(
                        attempts = attempt,
                        error = %err,
                        "retry budget exhausted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_cap_applies() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1)).with_max_backoff(Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[test]
    fn succeeds_first_try() {
        let calls = Cell::new(0);
        let out: Result<u32, TestError> = fast(3).run(|| {
            calls.set(calls.get() + 1);
            Ok(7)
        });
        assert_eq!(out, Ok(7));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn recovers_after_k_failures() {
        let calls = Cell::new(0);
        let out = fast(4).run(|| {
            calls.set(calls.get() + 1);
            if calls.get() <= 2 {
                Err(TestError::Flaky)
            } else {
                Ok("done")
            }
        });
        assert_eq!(out, Ok("done"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let out: Result<(), TestError> = fast(3).run(|| {
            calls.set(calls.get() + 1);
            Err(TestError::Flaky)
        });
        assert_eq!(out, Err(TestError::Flaky));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn fatal_error_not_retried() {
        let calls = Cell::new(0);
        let out: Result<(), TestError> = fast(5).run(|| {
            calls.set(calls.get() + 1);
            Err(TestError::Fatal)
        });
        assert_eq!(out, Err(TestError::Fatal));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn custom_classifier_overrides_trait() {
        let calls = Cell::new(0);
        let out: Result<(), TestError> = fast(3).run_if(
            |_| true,
            || {
                calls.set(calls.get() + 1);
                Err(TestError::Fatal)
            },
        );
        assert_eq!(out, Err(TestError::Fatal));
        assert_eq!(calls.get(), 3);
    }
}
