//! Retry policies and activity options
//!
//! A [`RetryPolicy`] bounds how often an activity is attempted and how long
//! the runtime waits between attempts. Delays grow exponentially from
//! `initial_interval` by `backoff_coefficient` and are capped at
//! `maximum_interval` (or 100x the initial interval when no cap is given).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cap multiplier applied when a policy has no explicit maximum interval.
const DEFAULT_MAXIMUM_INTERVAL_FACTOR: u32 = 100;

/// Exponential backoff policy for activity attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub backoff_coefficient: f64,
    /// Upper bound for a single delay.
    pub maximum_interval: Option<Duration>,
    /// Total attempts allowed, including the first one. 0 means unbounded.
    pub maximum_attempts: u32,
}

impl RetryPolicy {
    /// Policy starting at `initial_interval` with a 2.0 multiplier and no attempt bound.
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 0,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_maximum_interval(mut self, maximum: Duration) -> Self {
        self.maximum_interval = Some(maximum);
        self
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    /// Effective cap for a single delay.
    pub fn effective_maximum_interval(&self) -> Duration {
        self.maximum_interval
            .unwrap_or_else(|| self.initial_interval * DEFAULT_MAXIMUM_INTERVAL_FACTOR)
    }

    /// Delay to wait after `attempt` (1-indexed) failed.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let cap = self.effective_maximum_interval();
        if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Whether another attempt may follow `attempt` (1-indexed).
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Per-invocation activity settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Upper bound for a single attempt.
    pub start_to_close_timeout: Duration,
    /// Maximum silence between liveness pulses before the attempt is failed.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            start_to_close_timeout,
            heartbeat_timeout: None,
            retry,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}
