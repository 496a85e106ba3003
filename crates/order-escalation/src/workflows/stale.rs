//! Stale tier: wait for an operator or retry once after a delay
//!
//! The instance races the `resolve-stale-workflow` signal against a one
//! minute timer. A signal resolves the case without touching the remote
//! provider. The timer triggers one more lookup; if that fails too the case
//! moves to the manual tier. Every path ends in finalization.

use std::time::Duration;

use async_trait::async_trait;
use escalation_runtime::{
    ActivityFailure, RaceOutcome, SearchAttributes, StartOptions, Workflow, WorkflowContext,
    WorkflowError,
};
use tracing::{info, warn};

use super::manual::ManualHandleWorkflow;
use super::{finalization_options, stale_retry_options};
use crate::activities::{FinalizeStale, QueryOrder};
use crate::models::{
    manual_id, EscalationLevel, EscalationRecord, ManualRecord, RecordMetadata, Resolution,
    QUEUE_MANUAL_HANDLE, SIGNAL_RESOLVE_STALE, STALE_FAILURE_REASON,
};

/// How long an operator has before the automatic retry.
pub const STALE_RETRY_DELAY: Duration = Duration::from_secs(60);

pub struct StaleWorkflow;

impl StaleWorkflow {
    /// Hand the case to the manual tier.
    async fn escalate_to_manual(
        ctx: &mut WorkflowContext,
        request: &EscalationRecord,
        retry_failure: &ActivityFailure,
    ) -> Result<(), WorkflowError> {
        let info = ctx.info();
        let now = ctx.now().await?;

        let mut metadata = RecordMetadata::new("StaleWorkflow")
            .with_task_queue(QUEUE_MANUAL_HANDLE)
            .with_namespace(info.namespace.clone())
            .with_stale_start_time(request.failure_time)
            .with_original_failure_reason(request.failure_reason.clone())
            .with_escalation_level(EscalationLevel::ManualInterventionRequired);
        metadata.original_start_time = request.metadata.original_start_time;

        let record = ManualRecord {
            order_id: request.order_id.clone(),
            original_workflow_id: request.original_workflow_id.clone(),
            original_run_id: request.original_run_id.clone(),
            stale_workflow_id: info.instance_id.clone(),
            original_failure_reason: request.failure_reason.clone(),
            failure_reason: STALE_FAILURE_REASON.to_string(),
            stale_failure_time: now,
            original_error: request.original_error.clone(),
            stale_retry_error: retry_failure.to_string(),
            metadata,
        };

        let manual_workflow_id = manual_id(&request.original_workflow_id);
        let options = StartOptions::new(manual_workflow_id.clone(), QUEUE_MANUAL_HANDLE)
            .with_search_attributes(SearchAttributes {
                case_id: Some(request.order_id.clone()),
                keyword: Some("manual".to_string()),
                priority: 3,
                business_unit: info.search_attributes.business_unit.clone(),
                priority_label: info.search_attributes.priority_label.clone(),
                indexed_at: Some(now),
            });

        match ctx.start_child::<ManualHandleWorkflow>(options, record).await {
            Ok(ack) => {
                info!(manual_workflow_id = %ack.instance_id, "Manual handle workflow started");
                Ok(())
            }
            Err(e) if e.is_already_started() => {
                warn!(manual_workflow_id = %manual_workflow_id, "Manual handle workflow already running, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Workflow for StaleWorkflow {
    const KIND: &'static str = "Stale";
    type Input = EscalationRecord;
    /// Resolution label handed to finalization.
    type Output = String;

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        request: EscalationRecord,
    ) -> Result<String, WorkflowError> {
        let (resolution, note) = match ctx
            .race_signal_timer(SIGNAL_RESOLVE_STALE, STALE_RETRY_DELAY)
            .await?
        {
            RaceOutcome::Signal(payload) if !payload.is_empty() => {
                info!(order_id = %request.order_id, signal = %payload, "Manually resolved stale workflow");
                (Some(Resolution::ManualResolve), Some(payload))
            }
            RaceOutcome::Signal(_) => {
                warn!(order_id = %request.order_id, "Empty resolve signal, finalizing without a resolution");
                (None, None)
            }
            RaceOutcome::TimerFired => {
                info!(
                    original_workflow_id = %request.original_workflow_id,
                    "Retry timer expired, retrying order query"
                );
                match ctx
                    .execute_activity::<QueryOrder>(&stale_retry_options(), request.order_id.clone())
                    .await
                {
                    Ok(_) => (Some(Resolution::RetrySucceeded), None),
                    Err(WorkflowError::Activity(failure)) => {
                        Self::escalate_to_manual(ctx, &request, &failure).await?;
                        (Some(Resolution::MovedToManual), None)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let resolved_at = ctx.now().await?;
        let mut record = request;
        record.metadata = record.metadata.resolved(resolution, note, resolved_at);
        let label = record.metadata.resolution_label().to_string();

        ctx.execute_activity::<FinalizeStale>(&finalization_options(), record)
            .await?;
        Ok(label)
    }
}
