//! Fixed-window request budget for the primary throughput endpoint.
//!
//! Cloudflare allows roughly 600 requests per 10-minute window against
//! speed.cloudflare.com; the limiter keeps a conservative budget and absorbs
//! explicit 429 feedback. Waits run outside the mutex so every worker can
//! park on the same window reset; the reset itself compares the observed
//! window start so concurrent waiters never multiply-reset the counter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

use crate::core::debug_log::dbg_line;
use crate::core::types::ScanState;

/// Conservative request budget (the provider allows ~600).
pub const BUDGET: u32 = 550;
/// Fixed window length.
pub const WINDOW: Duration = Duration::from_secs(600);

const WINDOW_MS: u64 = 600_000;
/// 429 retry-after clamp. The provider sends punitive values (3600+) after
/// repeated violations even though the real window is 10 minutes.
const RETRY_AFTER_MIN_S: u64 = 30;
const RETRY_AFTER_MAX_S: u64 = 600;

/// Fixed-window counter with explicit server feedback.
///
/// All timestamps are monotonic milliseconds relative to construction.
/// `count` and `window_start` change only under the async mutex; the
/// read-only paths (`would_block`) go straight to the atomics.
pub struct RateLimiter {
    origin: Instant,
    count: AtomicU32,
    /// 0 = window not started yet.
    window_start_ms: AtomicU64,
    /// 0 = not blocked.
    blocked_until_ms: AtomicU64,
    gate: Mutex<()>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            count: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            blocked_until_ms: AtomicU64::new(0),
            gate: Mutex::new(()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Wait until a request slot is available, then count it.
    ///
    /// Blocks through any active 429 window first, then through a budget
    /// exhaustion wait if needed. An interrupted scan returns early without
    /// consuming a slot.
    pub async fn acquire(&self, state: Option<&ScanState>) {
        // Wait out any 429 block first, outside the lock.
        loop {
            let blocked = self.blocked_until_ms.load(Ordering::Relaxed);
            let now = self.now_ms();
            if blocked == 0 || now >= blocked {
                break;
            }
            if state.map(|s| s.is_interrupted()).unwrap_or(false) {
                return;
            }
            sleep(Duration::from_secs(1)).await;
        }

        let guard = self.gate.lock().await;

        // Re-check the block under the lock; a fresh 429 may have landed.
        let now = self.now_ms();
        let blocked = self.blocked_until_ms.load(Ordering::Relaxed);
        if blocked > 0 && now >= blocked {
            self.reset_window(now);
        }

        if self.window_start_ms.load(Ordering::Relaxed) == 0 {
            self.window_start_ms.store(now.max(1), Ordering::Relaxed);
        }
        let window_start = self.window_start_ms.load(Ordering::Relaxed);
        if now.saturating_sub(window_start) >= WINDOW_MS {
            self.reset_window(now);
        }

        if self.count.load(Ordering::Relaxed) >= BUDGET {
            let saved_window = self.window_start_ms.load(Ordering::Relaxed);
            let wait_until = saved_window + WINDOW_MS;
            if wait_until > now {
                dbg_line(
                    "RateLimiter",
                    &format!(
                        "budget exhausted ({} reqs), waiting {}s",
                        self.count.load(Ordering::Relaxed),
                        (wait_until - now) / 1000
                    ),
                );
                drop(guard);
                loop {
                    let now = self.now_ms();
                    if now >= wait_until {
                        break;
                    }
                    if state.map(|s| s.is_interrupted()).unwrap_or(false) {
                        return;
                    }
                    sleep(Duration::from_secs(1)).await;
                }
                let _guard = self.gate.lock().await;
                // Only reset if no other waiter already did.
                if self.window_start_ms.load(Ordering::Relaxed) == saved_window {
                    self.reset_window(self.now_ms());
                }
                self.count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.reset_window(now);
        }

        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn reset_window(&self, now: u64) {
        self.count.store(0, Ordering::Relaxed);
        self.window_start_ms.store(now.max(1), Ordering::Relaxed);
        self.blocked_until_ms.store(0, Ordering::Relaxed);
    }

    /// Read-only predicate: would `acquire` currently have to wait?
    /// Callers use it to steer a request to the fallback endpoint instead
    /// of enqueueing on the primary.
    pub fn would_block(&self) -> bool {
        let now = self.now_ms();
        let blocked = self.blocked_until_ms.load(Ordering::Relaxed);
        if blocked > 0 && now < blocked {
            return true;
        }
        let window_start = self.window_start_ms.load(Ordering::Relaxed);
        if window_start > 0
            && now.saturating_sub(window_start) < WINDOW_MS
            && self.count.load(Ordering::Relaxed) >= BUDGET
        {
            return true;
        }
        false
    }

    /// Absorb an upstream 429. `retry_after` is clamped to [30, 600] seconds
    /// and never shrinks an existing longer block.
    pub fn report_429(&self, retry_after_s: u64) {
        let capped = retry_after_s.clamp(RETRY_AFTER_MIN_S, RETRY_AFTER_MAX_S);
        let until = self.now_ms() + capped * 1000;
        let mut current = self.blocked_until_ms.load(Ordering::Relaxed);
        while until > current {
            match self.blocked_until_ms.compare_exchange(
                current,
                until,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    dbg_line(
                        "RateLimiter",
                        &format!(
                            "429 received (retry-after={}s, capped={}s)",
                            retry_after_s, capped
                        ),
                    );
                    break;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Requests counted in the current window (observability only).
    pub fn requests_in_window(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Seconds until the current block lifts, if any.
    pub fn blocked_for_secs(&self) -> Option<u64> {
        let blocked = self.blocked_until_ms.load(Ordering::Relaxed);
        let now = self.now_ms();
        if blocked > now {
            Some((blocked - now) / 1000)
        } else {
            None
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
