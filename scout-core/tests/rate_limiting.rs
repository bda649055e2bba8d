//! Timing and concurrency behaviour of the token bucket limiter.
//!
//! Bounds are measured from before the bucket is created, so refill that
//! happens while the test thread is scheduled out can only make the
//! observed time longer, never shorter.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use scout_core::ratelimit::{RateLimit, RateLimiter};

#[test]
fn fifth_acquire_waits_for_refill() {
    let limiter = RateLimiter::new();
    let start = Instant::now();
    limiter.set_limit("fbref", RateLimit::with_burst(2.0, 4.0).unwrap());

    for i in 0..4 {
        assert!(limiter.try_acquire("fbref"), "burst token {i}");
    }
    assert!(limiter.acquire("fbref"));

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "too slow: {elapsed:?}");
}

#[test]
fn sustained_rate_is_bounded() {
    let (rate, burst, n) = (20.0, 2.0, 8u32);
    let limiter = RateLimiter::new();
    let start = Instant::now();
    limiter.set_limit("espn", RateLimit::with_burst(rate, burst).unwrap());

    for _ in 0..n {
        assert!(limiter.acquire("espn"));
    }

    let floor = Duration::from_secs_f64((f64::from(n) - burst) / rate);
    assert!(start.elapsed() >= floor, "{:?} < {floor:?}", start.elapsed());
}

#[test]
fn racing_threads_share_the_last_token() {
    let limiter = Arc::new(RateLimiter::new());
    limiter.set_limit("sofascore", RateLimit::with_burst(0.001, 1.0).unwrap());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                limiter.try_acquire("sofascore")
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn timeout_gives_up() {
    let limiter = RateLimiter::new();
    limiter.set_limit("whoscored", RateLimit::with_burst(0.01, 1.0).unwrap());
    assert!(limiter.try_acquire("whoscored"));

    let start = Instant::now();
    assert!(!limiter.acquire_timeout("whoscored", Duration::from_millis(50)));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(50), "{waited:?}");
    assert!(waited < Duration::from_secs(1), "{waited:?}");
}

#[test]
fn unbounded_timeout_waits_for_the_next_token() {
    let limiter = RateLimiter::new();
    limiter.set_limit("sofascore", RateLimit::with_burst(1000.0, 1.0).unwrap());
    assert!(limiter.try_acquire("sofascore"));

    let start = Instant::now();
    assert!(limiter.acquire_timeout("sofascore", Duration::MAX));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn sources_do_not_share_budget() {
    let limiter = RateLimiter::new();
    limiter.set_limit("a", RateLimit::with_burst(0.001, 1.0).unwrap());
    limiter.set_limit("b", RateLimit::with_burst(0.001, 1.0).unwrap());

    assert!(limiter.try_acquire("a"));
    assert!(!limiter.try_acquire("a"));
    assert!(limiter.try_acquire("b"));
}

#[test]
fn unknown_source_gets_conservative_default() {
    let limiter = RateLimiter::new();
    assert!(limiter.try_acquire("never-configured"));
    assert!(limiter.try_acquire("never-configured"));
    assert!(!limiter.try_acquire("never-configured"));
    assert!(!limiter.is_configured("never-configured"));
}

#[test]
fn reset_refills_between_runs() {
    let limiter = RateLimiter::new();
    limiter.set_limit("x", RateLimit::with_burst(0.001, 3.0).unwrap());
    limiter.set_limit("y", RateLimit::with_burst(0.001, 1.0).unwrap());
    for _ in 0..3 {
        limiter.try_acquire("x");
    }
    limiter.try_acquire("y");

    limiter.reset(Some("x"));
    assert!(limiter.available("x").unwrap() >= 2.99);
    assert!(limiter.available("y").unwrap() < 0.5);

    limiter.reset(None);
    assert!(limiter.available("y").unwrap() >= 0.99);
}
