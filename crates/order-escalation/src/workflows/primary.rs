//! Primary tier: look the order up, escalate when retries run out

use async_trait::async_trait;
use escalation_runtime::{SearchAttributes, StartOptions, Workflow, WorkflowContext, WorkflowError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::query_order_options;
use super::stale::StaleWorkflow;
use crate::activities::QueryOrder;
use crate::models::{
    stale_id, EscalationRecord, RecordMetadata, PRIMARY_FAILURE_REASON, QUEUE_STALE_ORDER,
};

/// How a primary run ended. Both variants are successful completions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrimaryOutcome {
    Completed { result: String },
    Escalated { stale_workflow_id: String },
}

pub struct PrimaryWorkflow;

#[async_trait]
impl Workflow for PrimaryWorkflow {
    const KIND: &'static str = "QueryOrder";
    type Input = String;
    type Output = PrimaryOutcome;

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        order_id: String,
    ) -> Result<PrimaryOutcome, WorkflowError> {
        let failure = match ctx
            .execute_activity::<QueryOrder>(&query_order_options(), order_id.clone())
            .await
        {
            Ok(result) => return Ok(PrimaryOutcome::Completed { result }),
            Err(WorkflowError::Activity(failure)) => failure,
            Err(e) => return Err(e),
        };

        let info = ctx.info();
        let failure_time = ctx.now().await?;
        warn!(
            order_id = %order_id,
            attempts = failure.attempts,
            error = %failure.cause.message,
            "Order query exhausted its retries, escalating"
        );

        let record = EscalationRecord {
            order_id: order_id.clone(),
            original_workflow_id: info.instance_id.clone(),
            original_run_id: info.run_id.clone(),
            failure_reason: PRIMARY_FAILURE_REASON.to_string(),
            failure_time,
            max_attempts_reached: failure.attempts,
            original_error: failure.cause.message.clone(),
            metadata: RecordMetadata::new("QueryOrderWorkflow")
                .with_task_queue(QUEUE_STALE_ORDER)
                .with_namespace(info.namespace.clone())
                .with_original_start_time(info.started_at),
        };

        let stale_workflow_id = stale_id(&info.instance_id);
        let options = StartOptions::new(stale_workflow_id.clone(), QUEUE_STALE_ORDER)
            .with_search_attributes(SearchAttributes {
                case_id: Some(order_id),
                keyword: Some("stale".to_string()),
                priority: 2,
                business_unit: info.search_attributes.business_unit.clone(),
                priority_label: info.search_attributes.priority_label.clone(),
                indexed_at: Some(failure_time),
            });

        match ctx.start_child::<StaleWorkflow>(options, record).await {
            Ok(ack) => {
                info!(stale_workflow_id = %ack.instance_id, "Stale workflow started");
            }
            Err(e) if e.is_already_started() => {
                warn!(stale_workflow_id = %stale_workflow_id, "Stale workflow already running, skipping");
            }
            Err(e) => return Err(e),
        }
        Ok(PrimaryOutcome::Escalated { stale_workflow_id })
    }
}
