//! Per-credential rate limiting.
//!
//! Uses a sliding window log: each credential keeps the instants of its
//! accepted requests inside the window, and a request is admitted while
//! fewer than `max_requests` remain after pruning.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    /// Accepted request instants per credential id.
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether `key` may make another request and record it if so.
    pub async fn check_and_record(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let log = state.entry(key.to_string()).or_default();

        while let Some(oldest) = log.front() {
            if now.duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() as u32 >= self.max_requests {
            let oldest = log.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::Limited { retry_after };
        }

        log.push_back(now);
        RateDecision::Allowed {
            remaining: self.max_requests - log.len() as u32,
        }
    }
}
