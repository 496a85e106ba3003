//! Failure injection for the simulated remote operation
//!
//! The order lookup is a stand-in for a flaky external call. Whether an
//! attempt fails is decided by a [`FailureInjector`] handed to the activity
//! at construction, so tests can script exact outcomes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

/// Error texts the simulation draws from.
pub const FAILURE_CATALOG: [&str; 8] = [
    "Order not found",
    "Invalid order ID",
    "Order processing failed",
    "Payment provider returns internal error",
    "Customer card provider rejected",
    "Internal server error",
    "Database connection timeout",
    "Unknown error",
];

pub const DEFAULT_FAIL_PROBABILITY: f64 = 0.8;

/// Decides whether one attempt of the remote operation fails.
#[cfg_attr(test, mockall::automock)]
pub trait FailureInjector: Send + Sync {
    /// Error text for a failing attempt, `None` to succeed.
    fn next_failure(&self, order_id: &str, attempt: u32) -> Option<String>;
}

pub type SharedFailureInjector = Arc<dyn FailureInjector>;

/// Fails each attempt with a fixed probability.
#[derive(Debug, Clone)]
pub struct RandomFailures {
    probability: f64,
}

impl RandomFailures {
    /// Probability is clamped to `[0, 1]`; non-finite values fall back to
    /// the default.
    pub fn new(probability: f64) -> Self {
        let probability = if probability.is_finite() {
            probability.clamp(0.0, 1.0)
        } else {
            DEFAULT_FAIL_PROBABILITY
        };
        Self { probability }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl Default for RandomFailures {
    fn default() -> Self {
        Self::new(DEFAULT_FAIL_PROBABILITY)
    }
}

impl FailureInjector for RandomFailures {
    fn next_failure(&self, _order_id: &str, _attempt: u32) -> Option<String> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.probability) {
            let index = rng.gen_range(0..FAILURE_CATALOG.len());
            Some(FAILURE_CATALOG[index].to_string())
        } else {
            None
        }
    }
}

/// Plays back a fixed sequence of outcomes, then succeeds.
#[derive(Debug, Default)]
pub struct ScriptedFailures {
    script: Mutex<VecDeque<Option<String>>>,
    calls: AtomicU32,
}

impl ScriptedFailures {
    pub fn new<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    /// `count` failures with `error`, then success.
    pub fn failing(count: usize, error: &str) -> Self {
        Self::new(std::iter::repeat(Some(error.to_string())).take(count))
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Attempts observed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FailureInjector for ScriptedFailures {
    fn next_failure(&self, _order_id: &str, _attempt: u32) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .flatten()
    }
}

/// Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFail;

impl FailureInjector for NeverFail {
    fn next_failure(&self, _order_id: &str, _attempt: u32) -> Option<String> {
        None
    }
}
