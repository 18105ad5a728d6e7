//! Reconnect backoff for the signaling link
//!
//! Exponential backoff with a hard cap and a bounded retry budget.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for (re)connecting the signaling link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub retries: u32,
    /// Multiplier applied per retry
    pub factor: f64,
    /// Delay before the first retry, in milliseconds
    pub min_timeout_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            factor: 1.5,
            min_timeout_ms: 1_000,
            max_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let raw = self.min_timeout_ms as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.max_timeout_ms as f64).round();
        Duration::from_millis(capped as u64)
    }

    /// All delays of a full retry budget, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.retries).map(|retry| self.delay(retry)).collect()
    }
}

/// Per-channel retry bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Failed attempts since the last successful connect
    pub attempt: u32,
    /// Whether any connection attempt ever succeeded
    pub ever_connected: bool,
    pub next_delay: Option<Duration>,
}

impl RetryState {
    /// Record a failed attempt. Returns the delay to wait before the next
    /// attempt, or `None` when the budget is exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        self.attempt += 1;
        self.next_delay = if self.attempt > policy.retries {
            None
        } else {
            Some(policy.delay(self.attempt))
        };
        self.next_delay
    }

    pub fn record_success(&mut self) {
        self.attempt = 0;
        self.ever_connected = true;
        self.next_delay = None;
    }
}
