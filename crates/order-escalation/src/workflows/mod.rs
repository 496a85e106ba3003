//! The four processes of the escalation protocol
//!
//! ```text
//! QueryOrder ──(retries exhausted)──► Stale ──(retry failed)──► ManualHandleOrder
//!                                       │                            │
//!                                       ▼                            ▼
//!                               FinalizeStaleWorkflow        ConcludeQueryOrder
//! ```
//!
//! Delegation is detached: a tier starts the next one and never looks at
//! its outcome. `RegisterRecurringPayment` stands apart from the chain and
//! is started by a schedule.

use std::time::Duration;

use escalation_runtime::{ActivityOptions, RetryPolicy};

pub mod manual;
pub mod primary;
pub mod recurring;
pub mod stale;

pub use manual::ManualHandleWorkflow;
pub use primary::{PrimaryOutcome, PrimaryWorkflow};
pub use recurring::{RecurringPaymentWorkflow, RECURRING_CHANGE_ID};
pub use stale::{StaleWorkflow, STALE_RETRY_DELAY};

/// Order lookup from the primary tier: 3 attempts, 1s doubling to 60s.
pub fn query_order_options() -> ActivityOptions {
    ActivityOptions::new(
        Duration::from_secs(120),
        RetryPolicy::new(Duration::from_secs(1))
            .with_backoff_coefficient(2.0)
            .with_maximum_interval(Duration::from_secs(60))
            .with_maximum_attempts(3),
    )
    .with_heartbeat_timeout(Duration::from_secs(10))
}

/// The single delayed retry of the stale tier.
pub fn stale_retry_options() -> ActivityOptions {
    ActivityOptions::new(
        Duration::from_secs(120),
        RetryPolicy::new(Duration::from_secs(30))
            .with_backoff_coefficient(2.0)
            .with_maximum_interval(Duration::from_secs(300))
            .with_maximum_attempts(1),
    )
    .with_heartbeat_timeout(Duration::from_secs(10))
}

/// Finalization and conclusion side effects.
pub fn finalization_options() -> ActivityOptions {
    ActivityOptions::new(
        Duration::from_secs(300),
        RetryPolicy::new(Duration::from_secs(5))
            .with_backoff_coefficient(1.5)
            .with_maximum_interval(Duration::from_secs(120))
            .with_maximum_attempts(3),
    )
    .with_heartbeat_timeout(Duration::from_secs(30))
}

pub fn recurring_payment_options() -> ActivityOptions {
    ActivityOptions::new(
        Duration::from_secs(60),
        RetryPolicy::new(Duration::from_secs(1))
            .with_backoff_coefficient(2.0)
            .with_maximum_attempts(2),
    )
}
