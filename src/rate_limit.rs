#![allow(dead_code)]
//! Per-identity sliding-window rate limiter.
//!
//! One limiter instance guards one AI collaborator; the owner wraps it in a
//! `Mutex` and shares it between the services that call that collaborator.
//! State is process-local and resets on restart; it bounds upstream cost,
//! not correctness.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identity-map size that triggers a sweep of idle identities.
const SWEEP_THRESHOLD: usize = 10_000;

/// Sliding-window request counter keyed by identity string.
///
/// Every operation has an `*_at` variant taking an explicit `now` so tests
/// can drive a simulated clock; the plain variants use `Instant::now()`.
pub struct RateLimiter {
    windows: HashMap<String, Vec<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            max_requests,
            window,
        }
    }

    /// Convenience constructor for the common per-minute quota.
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Record a request for `identity` if it is within the limit.
    /// Returns `true` (allowed) or `false` (rejected).
    pub fn try_request(&mut self, identity: &str) -> bool {
        self.try_request_at(identity, Instant::now())
    }

    pub fn try_request_at(&mut self, identity: &str, now: Instant) -> bool {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let window = self.window;
        let entries = self.windows.entry(identity.to_string()).or_default();
        entries.retain(|ts| now.duration_since(*ts) < window);

        if entries.len() >= self.max_requests {
            return false;
        }

        entries.push(now);
        true
    }

    /// Non-mutating check: would a request for `identity` be rejected?
    pub fn would_exceed_limit(&self, identity: &str) -> bool {
        self.would_exceed_limit_at(identity, Instant::now())
    }

    pub fn would_exceed_limit_at(&self, identity: &str, now: Instant) -> bool {
        self.count_in_window(identity, now) >= self.max_requests
    }

    /// Requests left in the current window for `identity`.
    pub fn remaining_requests(&self, identity: &str) -> usize {
        self.remaining_requests_at(identity, Instant::now())
    }

    pub fn remaining_requests_at(&self, identity: &str, now: Instant) -> usize {
        self.max_requests
            .saturating_sub(self.count_in_window(identity, now))
    }

    /// Forget all recorded requests for `identity`.
    pub fn reset_limit(&mut self, identity: &str) {
        self.windows.remove(identity);
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    fn count_in_window(&self, identity: &str, now: Instant) -> usize {
        self.windows
            .get(identity)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|ts| now.duration_since(**ts) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop identities with no timestamp left inside the current window.
    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, entries| entries.iter().any(|ts| now.duration_since(*ts) < window));
        tracing::debug!(
            "RateLimiter: sweep complete, {} identities retained",
            self.windows.len()
        );
    }
}
