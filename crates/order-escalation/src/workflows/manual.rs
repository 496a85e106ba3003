//! Manual tier: wait, without a deadline, for an operator's resolution

use async_trait::async_trait;
use escalation_runtime::{Workflow, WorkflowContext, WorkflowError};
use tracing::{info, warn};

use super::finalization_options;
use crate::activities::ConcludeOrder;
use crate::models::{ConclusionRecord, ManualRecord, RESOLVED_BY_MANUAL, SIGNAL_RESOLVE_MANUAL};

pub struct ManualHandleWorkflow;

#[async_trait]
impl Workflow for ManualHandleWorkflow {
    const KIND: &'static str = "ManualHandleOrder";
    type Input = ManualRecord;
    type Output = ConclusionRecord;

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        request: ManualRecord,
    ) -> Result<ConclusionRecord, WorkflowError> {
        info!(
            order_id = %request.order_id,
            stale_workflow_id = %request.stale_workflow_id,
            "Waiting for manual resolution"
        );

        let resolution = loop {
            let payload = ctx.receive_signal(SIGNAL_RESOLVE_MANUAL).await?;
            if !payload.is_empty() {
                break payload;
            }
            warn!(order_id = %request.order_id, "Ignoring empty manual resolution");
        };

        let conclusion = ConclusionRecord {
            order_id: request.order_id,
            resolution,
            original_workflow_id: request.original_workflow_id,
            resolved_at: ctx.now().await?,
            resolved_by: RESOLVED_BY_MANUAL.to_string(),
        };
        ctx.execute_activity::<ConcludeOrder>(&finalization_options(), conclusion.clone())
            .await?;
        Ok(conclusion)
    }
}
