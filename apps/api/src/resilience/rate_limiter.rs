//! Sliding-window rate limiter keyed by string.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Keeps a log of attempt timestamps per key and rejects attempts beyond
/// `max_requests` within the trailing `window`. Rejected attempts are not logged,
/// so a caller that backs off regains capacity as old attempts age out.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    attempts: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let log = attempts.entry(key.to_string()).or_default();

        while let Some(&oldest) = log.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if (log.len() as u32) < self.max_requests {
            log.push_back(now);
            RateDecision::Allowed {
                remaining: self.max_requests - log.len() as u32,
            }
        } else {
            let retry_after = log
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            RateDecision::Limited { retry_after }
        }
    }

    /// Drops keys whose whole log has aged out.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.retain(|_, log| {
            log.back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < self.window)
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
