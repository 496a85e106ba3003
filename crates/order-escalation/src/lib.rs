//! Order Escalation
//!
//! A failing order lookup moves through three tiers, each a durable
//! workflow on the escalation runtime:
//!
//! 1. **Primary** (`QueryOrder`): three attempts with exponential backoff.
//! 2. **Stale** (`Stale`): waits a minute for an operator, then retries once.
//! 3. **Manual** (`ManualHandleOrder`): waits for an operator indefinitely.
//!
//! Recurring payments (`RegisterRecurringPayment`) run beside the chain on a
//! schedule and stay pinned to the payment version they first ran with.

pub mod activities;
pub mod app;
pub mod cli;
pub mod config;
pub mod failure;
pub mod ledger;
pub mod models;
pub mod workflows;

pub use app::Dependencies;
pub use config::AppConfig;
pub use failure::{FailureInjector, NeverFail, RandomFailures, ScriptedFailures};
pub use ledger::{JsonlLedger, MemoryLedger, Outcome, OutcomeLedger, TracingLedger};
