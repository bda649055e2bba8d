//! Attempt counting and backoff timing of the retry executor.

use std::cell::Cell;
use std::fmt;
use std::time::{Duration, Instant};

use scout_core::retry::{RetryPolicy, Retryable};

#[derive(Debug, PartialEq)]
enum NetError {
    Reset(u32),
    NotFound,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Reset(n) => write!(f, "connection reset on call {n}"),
            NetError::NotFound => f.write_str("404"),
        }
    }
}

impl Retryable for NetError {
    fn is_retryable(&self) -> bool {
        matches!(self, NetError::Reset(_))
    }
}

fn quick(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1))
}

#[test]
fn k_failures_then_success_calls_k_plus_one_times() {
    for k in 0..4u32 {
        let calls = Cell::new(0u32);
        let result = quick(5).run(|| {
            calls.set(calls.get() + 1);
            if calls.get() <= k {
                Err(NetError::Reset(calls.get()))
            } else {
                Ok("table")
            }
        });
        assert_eq!(result, Ok("table"));
        assert_eq!(calls.get(), k + 1, "k = {k}");
    }
}

#[test]
fn exhaustion_returns_the_last_error() {
    let calls = Cell::new(0u32);
    let result: Result<(), _> = quick(4).run(|| {
        calls.set(calls.get() + 1);
        Err(NetError::Reset(calls.get()))
    });
    assert_eq!(calls.get(), 4);
    assert_eq!(result, Err(NetError::Reset(4)));
}

#[test]
fn non_retryable_errors_stop_immediately() {
    let calls = Cell::new(0u32);
    let result: Result<(), _> = quick(5).run(|| {
        calls.set(calls.get() + 1);
        Err(NetError::NotFound)
    });
    assert_eq!(calls.get(), 1);
    assert_eq!(result, Err(NetError::NotFound));
}

#[test]
fn backoff_doubles_between_attempts() {
    // 20 + 40 + 80 ms of sleeping before the fourth attempt
    let policy = RetryPolicy::new(4, Duration::from_millis(20));
    let start = Instant::now();
    let result: Result<(), _> = policy.run(|| Err(NetError::Reset(0)));
    assert!(result.is_err());
    assert!(start.elapsed() >= Duration::from_millis(140), "{:?}", start.elapsed());
}

#[test]
fn custom_classifier_overrides_the_trait() {
    let calls = Cell::new(0u32);
    let result: Result<(), String> = quick(3).run_if(
        |e: &String| e.starts_with("busy"),
        || {
            calls.set(calls.get() + 1);
            Err(format!("busy {}", calls.get()))
        },
    );
    assert_eq!(calls.get(), 3);
    assert_eq!(result.unwrap_err(), "busy 3");
}
