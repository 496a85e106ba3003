//! Recurring payment dispatch
//!
//! Each consent is pinned to the payment version that was current when it
//! first ran. Raising [`CURRENT_PAYMENT_VERSION`] only affects consents that
//! have never run.

use async_trait::async_trait;
use escalation_runtime::{Workflow, WorkflowContext, WorkflowError};
use tracing::info;

use super::recurring_payment_options;
use crate::activities::{RecurringPaymentV1, RecurringPaymentV2, RecurringPaymentV3};
use crate::models::{PaymentVersion, CURRENT_PAYMENT_VERSION};

pub const RECURRING_CHANGE_ID: &str = "recurring-payment";

pub struct RecurringPaymentWorkflow {
    default_max: u32,
}

impl RecurringPaymentWorkflow {
    /// Dispatcher pinning new consents to `default_max`.
    pub fn with_default_version(default_max: u32) -> Self {
        Self { default_max }
    }
}

impl Default for RecurringPaymentWorkflow {
    fn default() -> Self {
        Self::with_default_version(CURRENT_PAYMENT_VERSION)
    }
}

#[async_trait]
impl Workflow for RecurringPaymentWorkflow {
    const KIND: &'static str = "RegisterRecurringPayment";
    type Input = String;
    type Output = String;

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        consent_id: String,
    ) -> Result<String, WorkflowError> {
        let number = ctx
            .recorded_version(RECURRING_CHANGE_ID, &consent_id, self.default_max)
            .await?;
        let version = PaymentVersion::from_number(number).ok_or_else(|| {
            WorkflowError::Application(format!("unsupported recurring payment version {number}"))
        })?;
        info!(consent_id = %consent_id, %version, "Using recurring payment version");

        let options = recurring_payment_options();
        match version {
            PaymentVersion::V1 => {
                ctx.execute_activity::<RecurringPaymentV1>(&options, consent_id)
                    .await
            }
            PaymentVersion::V2 => {
                ctx.execute_activity::<RecurringPaymentV2>(&options, consent_id)
                    .await
            }
            PaymentVersion::V3 => {
                ctx.execute_activity::<RecurringPaymentV3>(&options, consent_id)
                    .await
            }
        }
    }
}
