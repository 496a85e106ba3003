//! Activities: the side-effecting steps of the escalation chain
//!
//! - [`QueryOrder`]: the flaky remote lookup every tier retries
//! - [`FinalizeStale`]: records how an escalation ended
//! - [`ConcludeOrder`]: records a manual conclusion
//! - [`RecurringPaymentV1`] .. [`RecurringPaymentV3`]: versioned payment charges

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use escalation_runtime::{Activity, ActivityContext, ApplicationError};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::failure::SharedFailureInjector;
use crate::ledger::{LedgerError, Outcome, SharedLedger};
use crate::models::{ConclusionRecord, EscalationRecord, PaymentVersion};

/// Error type carried by failed order lookups.
pub const QUERY_ORDER_ERROR_TYPE: &str = "QueryOrderActivity";

fn ledger_error(e: LedgerError) -> ApplicationError {
    ApplicationError::new(e.to_string(), "LedgerError")
}

// =============================================================================
// QueryOrder
// =============================================================================

/// Simulated latency of one order lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTiming {
    pub lookup: Duration,
    pub processing: Duration,
}

impl Default for QueryTiming {
    fn default() -> Self {
        Self {
            lookup: Duration::from_secs(2),
            processing: Duration::from_secs(3),
        }
    }
}

/// Looks an order up at the remote provider.
pub struct QueryOrder {
    failures: SharedFailureInjector,
    timing: QueryTiming,
}

impl QueryOrder {
    pub fn new(failures: SharedFailureInjector) -> Self {
        Self {
            failures,
            timing: QueryTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: QueryTiming) -> Self {
        self.timing = timing;
        self
    }
}

#[async_trait]
impl Activity for QueryOrder {
    const NAME: &'static str = "QueryOrder";
    type Input = String;
    type Output = String;

    async fn run(&self, ctx: &ActivityContext, order_id: String) -> Result<String, ApplicationError> {
        let attempt = ctx.info().attempt;
        let activity_id = ctx.info().activity_id.clone();
        let started = Instant::now();
        info!(order_id = %order_id, attempt, "Querying order");

        ctx.heartbeat(&json!({"step": "initializing", "attempt": attempt, "order_id": order_id}));
        tokio::time::sleep(self.timing.lookup).await;
        ctx.heartbeat(&json!({"step": "processing", "attempt": attempt, "order_id": order_id}));
        tokio::time::sleep(self.timing.processing).await;

        if let Some(error) = self.failures.next_failure(&order_id, attempt) {
            ctx.heartbeat(&json!({
                "step": "failed",
                "attempt": attempt,
                "order_id": order_id,
                "error": error,
            }));
            warn!(order_id = %order_id, attempt, error = %error, "Order query failed");
            let details = json!({
                "error_type": error,
                "attempt": attempt,
                "order_id": order_id,
                "activity_id": activity_id,
                "timestamp": Utc::now(),
                "processing_time_ms": started.elapsed().as_millis() as u64,
            });
            return Err(ApplicationError::new(error, QUERY_ORDER_ERROR_TYPE).with_details(details));
        }

        ctx.heartbeat(&json!({
            "step": "completed",
            "attempt": attempt,
            "order_id": order_id,
            "result": "success",
        }));
        info!(order_id = %order_id, attempt, "Order query succeeded");
        Ok(format!("Order {order_id} processed successfully"))
    }
}

// =============================================================================
// Finalization
// =============================================================================

/// Terminal step of the escalation process.
pub struct FinalizeStale {
    ledger: SharedLedger,
}

impl FinalizeStale {
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Activity for FinalizeStale {
    const NAME: &'static str = "FinalizeStaleWorkflow";
    type Input = EscalationRecord;
    type Output = ();

    async fn run(&self, _ctx: &ActivityContext, record: EscalationRecord) -> Result<(), ApplicationError> {
        info!(
            order_id = %record.order_id,
            original_workflow_id = %record.original_workflow_id,
            resolution = record.metadata.resolution_label(),
            "Finalizing stale workflow"
        );
        self.ledger
            .record(&Outcome::StaleFinalized {
                record,
                recorded_at: Utc::now(),
            })
            .await
            .map_err(ledger_error)
    }
}

/// Terminal step of the manual process.
pub struct ConcludeOrder {
    ledger: SharedLedger,
}

impl ConcludeOrder {
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Activity for ConcludeOrder {
    const NAME: &'static str = "ConcludeQueryOrder";
    type Input = ConclusionRecord;
    type Output = ();

    async fn run(&self, _ctx: &ActivityContext, record: ConclusionRecord) -> Result<(), ApplicationError> {
        if record.resolution.is_empty() {
            return Err(ApplicationError::non_retryable(
                "conclusion without a resolution",
                "InvalidConclusion",
            ));
        }
        info!(
            order_id = %record.order_id,
            resolution = %record.resolution,
            resolved_by = %record.resolved_by,
            "Concluding query order"
        );
        self.ledger
            .record(&Outcome::OrderConcluded {
                record,
                recorded_at: Utc::now(),
            })
            .await
            .map_err(ledger_error)
    }
}

// =============================================================================
// Recurring payments
// =============================================================================

/// Shared charging logic behind every payment variant.
#[derive(Clone)]
pub struct PaymentProcessor {
    ledger: SharedLedger,
    delay: Duration,
}

impl PaymentProcessor {
    pub fn new(ledger: SharedLedger) -> Self {
        Self {
            ledger,
            delay: Duration::from_secs(30),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn charge(&self, consent_id: String, version: PaymentVersion) -> Result<String, ApplicationError> {
        tokio::time::sleep(self.delay).await;
        let amount = version.amount();
        info!(consent_id = %consent_id, %version, amount, "Processing payment");
        self.ledger
            .record(&Outcome::PaymentProcessed {
                consent_id,
                version: version.number(),
                amount,
                recorded_at: Utc::now(),
            })
            .await
            .map_err(ledger_error)?;
        Ok(format!("Payment of ${amount:.2} processed successfully"))
    }
}

macro_rules! payment_variant {
    ($name:ident, $activity:literal, $version:expr) => {
        pub struct $name(pub PaymentProcessor);

        #[async_trait]
        impl Activity for $name {
            const NAME: &'static str = $activity;
            type Input = String;
            type Output = String;

            async fn run(&self, _ctx: &ActivityContext, consent_id: String) -> Result<String, ApplicationError> {
                self.0.charge(consent_id, $version).await
            }
        }
    };
}

payment_variant!(RecurringPaymentV1, "RecurringPaymentV1", PaymentVersion::V1);
payment_variant!(RecurringPaymentV2, "RecurringPaymentV2", PaymentVersion::V2);
payment_variant!(RecurringPaymentV3, "RecurringPaymentV3", PaymentVersion::V3);
