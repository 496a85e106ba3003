//! Activities: side-effecting units of work invoked with retry
//!
//! Each attempt runs under the start-to-close timeout and, when configured,
//! a heartbeat watchdog. Failed attempts are retried according to the
//! [`RetryPolicy`](crate::retry::RetryPolicy) until it runs out of attempts
//! or an attempt reports a non-retryable error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ActivityFailure, ApplicationError};
use crate::events::{EventBus, RuntimeEvent};
use crate::retry::ActivityOptions;

/// A named unit of work.
///
/// Activities may do anything: network calls, sleeping, randomness. Their
/// results are recorded, so a replayed workflow never runs them twice.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Registration name, recorded in history.
    const NAME: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ApplicationError>;
}

/// Identity of one activity attempt.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub activity: &'static str,
    /// Stable across attempts of the same invocation.
    pub activity_id: String,
    pub instance_id: String,
    /// 1-indexed.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// Handle passed to a running activity attempt.
pub struct ActivityContext {
    info: ActivityInfo,
    pulse: watch::Sender<Instant>,
}

impl ActivityContext {
    fn new(info: ActivityInfo) -> (Self, watch::Receiver<Instant>) {
        let (pulse, rx) = watch::channel(Instant::now());
        (Self { info, pulse }, rx)
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    /// Report liveness. `details` is logged for observability only.
    pub fn heartbeat<T: Serialize + ?Sized>(&self, details: &T) {
        let details = serde_json::to_string(details).unwrap_or_default();
        debug!(
            activity = self.info.activity,
            activity_id = %self.info.activity_id,
            attempt = self.info.attempt,
            details = %details,
            "Heartbeat"
        );
        let _ = self.pulse.send(Instant::now());
    }
}

// =========================================================================
// Type erasure
// =========================================================================

#[async_trait]
pub(crate) trait ErasedActivity: Send + Sync {
    async fn run_json(
        &self,
        ctx: &ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ApplicationError>;
}

pub(crate) struct ActivityAdapter<A>(pub A);

#[async_trait]
impl<A: Activity> ErasedActivity for ActivityAdapter<A> {
    async fn run_json(
        &self,
        ctx: &ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ApplicationError> {
        let input: A::Input = serde_json::from_value(input).map_err(|e| {
            ApplicationError::non_retryable(format!("invalid input: {e}"), "InvalidInput")
        })?;
        let output = self.0.run(ctx, input).await?;
        serde_json::to_value(output).map_err(|e| {
            ApplicationError::non_retryable(format!("invalid output: {e}"), "InvalidOutput")
        })
    }
}

// =========================================================================
// Invoke with retry
// =========================================================================

/// Where an invocation comes from, for attempt identities and events.
pub(crate) struct Invocation<'a> {
    pub activity: &'static str,
    pub activity_id: String,
    pub instance_id: &'a str,
    pub events: &'a EventBus,
    pub now: &'a (dyn Fn() -> DateTime<Utc> + Send + Sync),
}

/// Run `activity` until it succeeds or its retry policy is exhausted.
/// Returns the output and the number of attempts made.
pub(crate) async fn invoke_with_retry(
    activity: &Arc<dyn ErasedActivity>,
    options: &ActivityOptions,
    input: serde_json::Value,
    invocation: Invocation<'_>,
) -> Result<(serde_json::Value, u32), ActivityFailure> {
    let mut attempt = 1;
    loop {
        let info = ActivityInfo {
            activity: invocation.activity,
            activity_id: invocation.activity_id.clone(),
            instance_id: invocation.instance_id.to_string(),
            attempt,
            started_at: (invocation.now)(),
        };

        let error = match run_attempt(activity, options, input.clone(), info).await {
            Ok(output) => return Ok((output, attempt)),
            Err(error) => error,
        };

        let will_retry = !error.non_retryable && options.retry.has_attempts_left(attempt);
        warn!(
            instance_id = invocation.instance_id,
            activity = invocation.activity,
            attempt,
            will_retry,
            error = %error,
            "Activity attempt failed"
        );
        invocation.events.publish(RuntimeEvent::ActivityAttemptFailed {
            instance_id: invocation.instance_id.to_string(),
            activity: invocation.activity.to_string(),
            attempt,
            error: error.message.clone(),
            will_retry,
            timestamp: (invocation.now)(),
        });

        if !will_retry {
            return Err(ActivityFailure {
                activity: invocation.activity.to_string(),
                attempts: attempt,
                cause: error,
            });
        }

        tokio::time::sleep(options.retry.delay_after_attempt(attempt)).await;
        attempt += 1;
    }
}

async fn run_attempt(
    activity: &Arc<dyn ErasedActivity>,
    options: &ActivityOptions,
    input: serde_json::Value,
    info: ActivityInfo,
) -> Result<serde_json::Value, ApplicationError> {
    let (ctx, pulses) = ActivityContext::new(info);
    let work = tokio::time::timeout(options.start_to_close_timeout, activity.run_json(&ctx, input));

    tokio::select! {
        result = work => result.unwrap_or_else(|_| Err(ApplicationError::timeout("start-to-close"))),
        () = heartbeat_watchdog(pulses, options.heartbeat_timeout) => {
            Err(ApplicationError::timeout("heartbeat"))
        }
    }
}

/// Resolves once the attempt has been silent for longer than `timeout`.
async fn heartbeat_watchdog(
    mut pulses: watch::Receiver<Instant>,
    timeout: Option<std::time::Duration>,
) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        let deadline = *pulses.borrow_and_update() + timeout;
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return,
            changed = pulses.changed() => {
                if changed.is_err() {
                    // Attempt finished; the select above settles it.
                    return std::future::pending().await;
                }
            }
        }
    }
}
