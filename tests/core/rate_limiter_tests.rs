//! Tests for the fixed-window rate limiter. Time is paused so window
//! waits complete instantly on the virtual clock.

use std::sync::Arc;

use tokio::time::Instant;

use cfscan::core::rate_limiter::{RateLimiter, BUDGET, WINDOW};

#[tokio::test(start_paused = true)]
async fn budget_is_not_exceeded_within_a_window() {
    let limiter = RateLimiter::new();
    for _ in 0..BUDGET {
        limiter.acquire(None).await;
    }
    assert_eq!(limiter.requests_in_window(), BUDGET);
    assert!(limiter.would_block());
}

#[tokio::test(start_paused = true)]
async fn the_551st_acquire_waits_for_the_window_reset() {
    let limiter = RateLimiter::new();
    for _ in 0..BUDGET {
        limiter.acquire(None).await;
    }

    let t0 = Instant::now();
    limiter.acquire(None).await;
    let waited = t0.elapsed();
    assert!(
        waited >= WINDOW - std::time::Duration::from_secs(2),
        "waited only {:?}",
        waited
    );
    // The new window starts with just this request counted.
    assert_eq!(limiter.requests_in_window(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_waiters_reset_the_window_once() {
    let limiter = Arc::new(RateLimiter::new());
    for _ in 0..BUDGET {
        limiter.acquire(None).await;
    }

    let mut handles = Vec::new();
    for _ in 0..3 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire(None).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // A multiply-reset window would have lost some of the three counts.
    assert_eq!(limiter.requests_in_window(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_after_is_clamped_to_the_window() {
    let limiter = RateLimiter::new();

    limiter.report_429(3_600);
    let blocked = limiter.blocked_for_secs().expect("blocked");
    assert!(blocked <= 600 && blocked >= 598, "blocked {}s", blocked);

    // A shorter follow-up report never shrinks the block.
    limiter.report_429(5);
    let still = limiter.blocked_for_secs().expect("still blocked");
    assert!(still >= 595, "block shrank to {}s", still);
}

#[tokio::test(start_paused = true)]
async fn small_retry_after_is_raised_to_the_floor() {
    let limiter = RateLimiter::new();
    limiter.report_429(5);
    let blocked = limiter.blocked_for_secs().expect("blocked");
    assert!((28..=30).contains(&blocked), "blocked {}s", blocked);
    assert!(limiter.would_block());
}

#[tokio::test(start_paused = true)]
async fn acquire_waits_out_a_429_block() {
    let limiter = RateLimiter::new();
    limiter.report_429(45);

    let t0 = Instant::now();
    limiter.acquire(None).await;
    assert!(t0.elapsed() >= std::time::Duration::from_secs(44));
    assert_eq!(limiter.requests_in_window(), 1);
}
