use std::collections::HashMap;
use tokio::time::{Duration, Instant};

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by user id.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: HashMap<i64, Window>,
}

pub struct RateLimitResult {
    pub allowed: bool,
    pub retry_after_ms: Option<u64>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            entries: HashMap::new(),
        }
    }

    pub fn check(&mut self, user_id: i64) -> RateLimitResult {
        let now = Instant::now();
        let window = self.window;

        let entry = self.entries.entry(user_id).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            return RateLimitResult {
                allowed: true,
                retry_after_ms: None,
            };
        }

        let remaining = window.saturating_sub(now.duration_since(entry.started));
        RateLimitResult {
            allowed: false,
            retry_after_ms: Some(remaining.as_millis() as u64),
        }
    }

    /// Drops windows that have fully elapsed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries
            .retain(|_, entry| now.duration_since(entry.started) < window);
    }

    pub fn tracked_users(&self) -> usize {
        self.entries.len()
    }
}
