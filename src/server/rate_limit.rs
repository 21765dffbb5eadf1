//! Per-user fixed-window rate limiting for the stream endpoint.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::ids::UserId;

/// Expired windows are swept once the map grows past this size.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Clone, Copy, Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by user.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: DashMap<UserId, Window>,
}

impl RateLimiter {
    /// Create a limiter from settings.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            max_requests: config.max_requests,
            windows: DashMap::new(),
        }
    }

    /// Count one request for `user`; `false` once the window's budget is spent.
    pub fn try_acquire(&self, user: &UserId) -> bool {
        self.try_acquire_at(user, Instant::now())
    }

    fn try_acquire_at(&self, user: &UserId, now: Instant) -> bool {
        if self.windows.len() > SWEEP_THRESHOLD {
            let window = self.window;
            self.windows
                .retain(|_, entry| now.duration_since(entry.started) < window);
        }

        let mut entry = self.windows.entry(user.clone()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window_secs: 60,
            max_requests,
        })
    }

    #[test]
    fn test_budget_is_per_user() {
        let limiter = limiter(2);
        let (alice, bob) = (UserId::new("alice"), UserId::new("bob"));
        assert!(limiter.try_acquire(&alice));
        assert!(limiter.try_acquire(&alice));
        assert!(!limiter.try_acquire(&alice));
        assert!(limiter.try_acquire(&bob));
    }

    #[test]
    fn test_window_resets() {
        let limiter = limiter(1);
        let alice = UserId::new("alice");
        let start = Instant::now();
        assert!(limiter.try_acquire_at(&alice, start));
        assert!(!limiter.try_acquire_at(&alice, start + Duration::from_secs(30)));
        assert!(limiter.try_acquire_at(&alice, start + Duration::from_secs(61)));
    }
}
