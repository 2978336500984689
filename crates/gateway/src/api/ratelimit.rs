//! In-memory sliding-window rate limiting, keyed by a credential digest.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};

const WINDOW: Duration = Duration::from_secs(60);

/// Derive a stable, non-reversible limiter key from the bearer token.
pub fn credential_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Per-key sliding window over the last 60 seconds.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt under `scope:key`; returns whether it is allowed.
    pub fn check(&self, scope: &str, key: &str, limit: u32) -> bool {
        let full_key = format!("{scope}:{key}");
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(full_key).or_default();

        while window.front().is_some_and(|t| now - *t >= WINDOW) {
            window.pop_front();
        }

        if window.len() >= limit as usize {
            return false;
        }
        window.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.check("message", "k1", 5));
        }
        assert!(!limiter.check("message", "k1", 5));
    }

    #[test]
    fn scopes_and_keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("message", "k1", 1));
        assert!(!limiter.check("message", "k1", 1));
        // Different key and different scope still pass.
        assert!(limiter.check("message", "k2", 1));
        assert!(limiter.check("chat_create", "k1", 1));
    }

    #[test]
    fn credential_key_is_stable_and_opaque() {
        let a = credential_key("secret-token");
        let b = credential_key("secret-token");
        let c = credential_key("other-token");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(!a.contains("secret"));
    }
}
