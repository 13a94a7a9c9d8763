//! Fixed-window request limiting per subject.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nexus_config::RateLimitConfig;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    anonymous_limit: u32,
    authenticated_limit: u32,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            anonymous_limit: config.anonymous_per_minute,
            authenticated_limit: config.authenticated_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// `true` when the request fits in the current window.
    pub fn allow(&self, subject: &str, authenticated: bool) -> bool {
        let limit = if authenticated {
            self.authenticated_limit
        } else {
            self.anonymous_limit
        };
        if limit == 0 {
            return true;
        }

        let mut windows = self.windows.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let entry = windows.entry(subject.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= WINDOW {
            *entry = (now, 0);
        }
        if entry.1 >= limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_per_subject_window() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            anonymous_per_minute: 2,
            authenticated_per_minute: 100,
        });

        assert!(limiter.allow("anon", false));
        assert!(limiter.allow("anon", false));
        assert!(!limiter.allow("anon", false));
        // A different subject has its own window
        assert!(limiter.allow("other", false));
        // Authenticated limit is separate
        assert!(limiter.allow("anon", true));
    }

    #[test]
    fn zero_limit_disables() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            anonymous_per_minute: 0,
            authenticated_per_minute: 0,
        });
        for _ in 0..100 {
            assert!(limiter.allow("anyone", false));
        }
    }
}
