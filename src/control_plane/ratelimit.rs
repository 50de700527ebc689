//! Fixed-window rate limiter, keyed per client IP.
//!
//! spec.md's testable property wants an exact fixed-window counter, so this
//! is hand-rolled on the same `DashMap` the rest of the crate uses for
//! concurrent maps rather than pulling in a token-bucket/GCRA limiter
//! (see DESIGN.md).

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// `None` if the request is allowed under the current window; otherwise
    /// `Some(retry_after_ms)`, the time remaining until the window resets.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            started_at: now,
            count: 0,
        });
        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }
        if entry.count >= self.max_requests {
            let elapsed = now.duration_since(entry.started_at);
            return Some(self.window.saturating_sub(elapsed).as_millis() as u64);
        }
        entry.count += 1;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects() {
        let limiter = FixedWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4").is_none());
        assert!(limiter.check("1.2.3.4").is_none());
        assert!(limiter.check("1.2.3.4").is_none());
        assert!(limiter.check("1.2.3.4").is_some());
    }

    #[test]
    fn window_resets_after_elapsed() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(10));
        assert!(limiter.check("k").is_none());
        assert!(limiter.check("k").is_some());
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check("k").is_none());
    }

    #[test]
    fn separate_keys_have_separate_windows() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").is_none());
        assert!(limiter.check("b").is_none());
    }

    #[test]
    fn rejection_reports_remaining_window_as_retry_after() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(200));
        assert!(limiter.check("k").is_none());
        let retry_after_ms = limiter.check("k").expect("second request should be rejected");
        assert!(retry_after_ms > 0 && retry_after_ms <= 200);
    }
}
