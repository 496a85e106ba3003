//! Integration tests for the escalation chain
//!
//! Every test runs on paused tokio time over an in-memory store, with order
//! lookups failing exactly as scripted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use escalation_runtime::{
    InstanceStatus, MemoryStore, Runtime, RuntimeError, RuntimeEvent, StartOptions, Worker,
    WorkerOptions,
};
use order_escalation::app::{self, Dependencies};
use order_escalation::ledger::{MemoryLedger, Outcome};
use order_escalation::models::{
    EscalationRecord, ManualRecord, RecordMetadata, Resolution, DEFAULT_MANUAL_RESOLUTION,
    PRIMARY_FAILURE_REASON, QUEUE_MANUAL_HANDLE, QUEUE_QUERY_ORDER, QUEUE_STALE_ORDER,
    RESOLVED_BY_MANUAL, SIGNAL_RESOLVE_MANUAL, SIGNAL_RESOLVE_STALE,
};
use order_escalation::workflows::{
    ManualHandleWorkflow, PrimaryOutcome, PrimaryWorkflow, StaleWorkflow,
};
use order_escalation::ScriptedFailures;
use tokio::time::Instant;

struct Harness {
    runtime: Runtime,
    failures: Arc<ScriptedFailures>,
    ledger: Arc<MemoryLedger>,
}

fn harness(failures: ScriptedFailures) -> Harness {
    let failures = failures.shared();
    let ledger = MemoryLedger::new().shared();
    let deps = Dependencies::new(failures.clone(), ledger.clone());
    let runtime = Runtime::builder(MemoryStore::new().shared())
        .registry(app::registry(&deps))
        .build();
    Harness {
        runtime,
        failures,
        ledger,
    }
}

fn escalation_record(primary_id: &str) -> EscalationRecord {
    EscalationRecord {
        order_id: "A1".to_string(),
        original_workflow_id: primary_id.to_string(),
        original_run_id: "run-1".to_string(),
        failure_reason: PRIMARY_FAILURE_REASON.to_string(),
        failure_time: Utc::now(),
        max_attempts_reached: 3,
        original_error: "Order not found".to_string(),
        metadata: RecordMetadata::new("QueryOrderWorkflow").with_task_queue(QUEUE_STALE_ORDER),
    }
}

async fn start_stale(runtime: &Runtime, primary_id: &str) -> String {
    let stale_id = format!("stale-{primary_id}");
    runtime
        .start_workflow::<StaleWorkflow>(
            StartOptions::new(stale_id.clone(), QUEUE_STALE_ORDER),
            escalation_record(primary_id),
        )
        .await
        .unwrap();
    stale_id
}

fn stale_finalizations(ledger: &MemoryLedger) -> Vec<EscalationRecord> {
    ledger
        .outcomes()
        .into_iter()
        .filter_map(|o| match o {
            Outcome::StaleFinalized { record, .. } => Some(record),
            _ => None,
        })
        .collect()
}

async fn is_missing(runtime: &Runtime, instance_id: &str) -> bool {
    matches!(
        runtime.describe(instance_id).await,
        Err(RuntimeError::InstanceNotFound(_))
    )
}

// =============================================================================
// Primary
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_primary_success_does_not_escalate() {
    let h = harness(ScriptedFailures::failing(1, "Internal server error"));
    h.runtime
        .start_workflow::<PrimaryWorkflow>(StartOptions::new("A1", QUEUE_QUERY_ORDER), "A1".to_string())
        .await
        .unwrap();

    assert_eq!(h.runtime.run_instance("A1").await.unwrap(), InstanceStatus::Completed);
    let output: PrimaryOutcome =
        serde_json::from_value(h.runtime.describe("A1").await.unwrap().output.unwrap()).unwrap();
    assert_eq!(
        output,
        PrimaryOutcome::Completed {
            result: "Order A1 processed successfully".to_string()
        }
    );
    assert_eq!(h.failures.calls(), 2);
    assert!(is_missing(&h.runtime, "stale-A1").await);
}

#[tokio::test(start_paused = true)]
async fn test_primary_exhaustion_starts_exactly_one_stale_instance() {
    let h = harness(ScriptedFailures::failing(3, "Order not found"));
    let mut events = h.runtime.subscribe();
    h.runtime
        .start_workflow::<PrimaryWorkflow>(StartOptions::new("A1", QUEUE_QUERY_ORDER), "A1".to_string())
        .await
        .unwrap();

    let started = Instant::now();
    assert_eq!(h.runtime.run_instance("A1").await.unwrap(), InstanceStatus::Completed);
    // Three 5s lookups with 1s and 2s of backoff between them.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(18) && elapsed < Duration::from_secs(19), "{elapsed:?}");
    assert_eq!(h.failures.calls(), 3);

    let primary = h.runtime.describe("A1").await.unwrap();
    assert!(primary.failure.is_none());
    assert_eq!(
        serde_json::from_value::<PrimaryOutcome>(primary.output.unwrap()).unwrap(),
        PrimaryOutcome::Escalated {
            stale_workflow_id: "stale-A1".to_string()
        }
    );

    let stale = h.runtime.describe("stale-A1").await.unwrap();
    assert_eq!(stale.kind, "Stale");
    assert_eq!(stale.task_queue, QUEUE_STALE_ORDER);
    assert_eq!(stale.status, InstanceStatus::Pending);
    assert_eq!(stale.parent.unwrap().instance_id, "A1");
    assert_eq!(stale.search_attributes.keyword.as_deref(), Some("stale"));
    assert_eq!(stale.search_attributes.priority, 2);

    let record: EscalationRecord = serde_json::from_value(stale.input).unwrap();
    assert_eq!(record.order_id, "A1");
    assert_eq!(record.original_workflow_id, "A1");
    assert_eq!(record.original_run_id, primary.run_id);
    assert_eq!(record.max_attempts_reached, 3);
    assert_eq!(record.original_error, "Order not found");
    assert_eq!(record.failure_reason, PRIMARY_FAILURE_REASON);
    assert_eq!(record.metadata.task_queue.as_deref(), Some(QUEUE_STALE_ORDER));
    assert_eq!(record.metadata.original_start_time, Some(primary.created_at));

    let mut stale_starts = 0;
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::InstanceStarted { instance_id, .. } = event {
            if instance_id.starts_with("stale-") {
                stale_starts += 1;
            }
        }
    }
    assert_eq!(stale_starts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_primary_tolerates_already_running_stale_instance() {
    let h = harness(ScriptedFailures::failing(3, "Order not found"));
    start_stale(&h.runtime, "A1").await;
    h.runtime
        .start_workflow::<PrimaryWorkflow>(StartOptions::new("A1", QUEUE_QUERY_ORDER), "A1".to_string())
        .await
        .unwrap();

    assert_eq!(h.runtime.run_instance("A1").await.unwrap(), InstanceStatus::Completed);
}

// =============================================================================
// Stale
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_signal_before_timer_resolves_without_retry() {
    let h = harness(ScriptedFailures::default());
    let stale_id = start_stale(&h.runtime, "A1").await;

    let task = tokio::spawn({
        let runtime = h.runtime.clone();
        let stale_id = stale_id.clone();
        async move { runtime.run_instance(&stale_id).await }
    });
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.runtime
        .signal(&stale_id, SIGNAL_RESOLVE_STALE, "refund approved")
        .await
        .unwrap();

    assert_eq!(task.await.unwrap().unwrap(), InstanceStatus::Completed);
    assert_eq!(
        h.runtime.describe(&stale_id).await.unwrap().output,
        Some(serde_json::json!("manual-resolve"))
    );
    assert_eq!(h.failures.calls(), 0, "remote operation must not run again");
    assert!(is_missing(&h.runtime, "manual-A1").await);

    let finalized = stale_finalizations(&h.ledger);
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].metadata.resolution, Some(Resolution::ManualResolve));
    assert_eq!(finalized[0].metadata.resolution_note.as_deref(), Some("refund approved"));
    assert!(finalized[0].metadata.resolved_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_timer_then_successful_retry() {
    let h = harness(ScriptedFailures::default());
    let stale_id = start_stale(&h.runtime, "A1").await;

    let started = Instant::now();
    assert_eq!(h.runtime.run_instance(&stale_id).await.unwrap(), InstanceStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(65));

    assert_eq!(
        h.runtime.describe(&stale_id).await.unwrap().output,
        Some(serde_json::json!("retry-succeeded"))
    );
    assert_eq!(h.failures.calls(), 1);
    assert!(is_missing(&h.runtime, "manual-A1").await);

    let finalized = stale_finalizations(&h.ledger);
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].metadata.resolution_label(), "retry-succeeded");
}

#[tokio::test(start_paused = true)]
async fn test_timer_then_failed_retry_moves_to_manual() {
    let h = harness(ScriptedFailures::failing(1, "Database connection timeout"));
    let stale_id = start_stale(&h.runtime, "A1").await;

    assert_eq!(h.runtime.run_instance(&stale_id).await.unwrap(), InstanceStatus::Completed);
    assert_eq!(
        h.runtime.describe(&stale_id).await.unwrap().output,
        Some(serde_json::json!("moved-to-manual"))
    );
    assert_eq!(h.failures.calls(), 1, "the stale retry is a single attempt");

    let manual = h.runtime.describe("manual-A1").await.unwrap();
    assert_eq!(manual.kind, "ManualHandleOrder");
    assert_eq!(manual.task_queue, QUEUE_MANUAL_HANDLE);
    assert_eq!(manual.search_attributes.keyword.as_deref(), Some("manual"));
    assert_eq!(manual.search_attributes.priority, 3);
    assert_eq!(manual.parent.unwrap().instance_id, stale_id);

    let record: ManualRecord = serde_json::from_value(manual.input).unwrap();
    assert_eq!(record.original_workflow_id, "A1");
    assert_eq!(record.stale_workflow_id, stale_id);
    assert_eq!(record.original_error, "Order not found");
    assert!(record.stale_retry_error.contains("Database connection timeout"));
    assert_eq!(record.original_failure_reason, PRIMARY_FAILURE_REASON);
    assert_eq!(
        record.metadata.original_failure_reason.as_deref(),
        Some(PRIMARY_FAILURE_REASON)
    );
    assert!(record.metadata.escalation_level.is_some());

    let finalized = stale_finalizations(&h.ledger);
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].metadata.resolution, Some(Resolution::MovedToManual));
}

#[tokio::test(start_paused = true)]
async fn test_empty_stale_signal_finalizes_as_unknown() {
    let h = harness(ScriptedFailures::default());
    let stale_id = start_stale(&h.runtime, "A1").await;
    h.runtime.signal(&stale_id, SIGNAL_RESOLVE_STALE, "").await.unwrap();

    assert_eq!(h.runtime.run_instance(&stale_id).await.unwrap(), InstanceStatus::Completed);
    assert_eq!(h.failures.calls(), 0);
    let finalized = stale_finalizations(&h.ledger);
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].metadata.resolution_label(), "unknown");
}

// =============================================================================
// Manual
// =============================================================================

fn manual_record() -> ManualRecord {
    ManualRecord {
        order_id: "A1".to_string(),
        original_workflow_id: "A1".to_string(),
        original_run_id: "run-1".to_string(),
        stale_workflow_id: "stale-A1".to_string(),
        original_failure_reason: PRIMARY_FAILURE_REASON.to_string(),
        failure_reason: "Stale workflow retry failed after delay".to_string(),
        stale_failure_time: Utc::now(),
        original_error: "Order not found".to_string(),
        stale_retry_error: "Internal server error".to_string(),
        metadata: RecordMetadata::new("StaleWorkflow"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_manual_waits_without_deadline_and_ignores_empty_payloads() {
    let h = harness(ScriptedFailures::default());
    h.runtime
        .start_workflow::<ManualHandleWorkflow>(
            StartOptions::new("manual-A1", QUEUE_MANUAL_HANDLE),
            manual_record(),
        )
        .await
        .unwrap();

    let task = tokio::spawn({
        let runtime = h.runtime.clone();
        async move { runtime.run_instance("manual-A1").await }
    });

    // Hours later it is still waiting.
    tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
    assert!(!task.is_finished());
    assert_eq!(
        h.runtime.describe("manual-A1").await.unwrap().status,
        InstanceStatus::Running
    );

    h.runtime.signal("manual-A1", SIGNAL_RESOLVE_MANUAL, "").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!task.is_finished(), "empty payload must be ignored");

    h.runtime
        .signal("manual-A1", SIGNAL_RESOLVE_MANUAL, "refund issued")
        .await
        .unwrap();
    assert_eq!(task.await.unwrap().unwrap(), InstanceStatus::Completed);

    let conclusions: Vec<_> = h
        .ledger
        .outcomes()
        .into_iter()
        .filter_map(|o| match o {
            Outcome::OrderConcluded { record, .. } => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(conclusions.len(), 1);
    assert_eq!(conclusions[0].resolution, "refund issued");
    assert_eq!(conclusions[0].resolved_by, RESOLVED_BY_MANUAL);
    assert_eq!(conclusions[0].original_workflow_id, "A1");
}

#[tokio::test(start_paused = true)]
async fn test_signal_to_closed_instance_is_rejected() {
    let h = harness(ScriptedFailures::default());
    h.runtime
        .start_workflow::<ManualHandleWorkflow>(
            StartOptions::new("manual-A1", QUEUE_MANUAL_HANDLE),
            manual_record(),
        )
        .await
        .unwrap();
    h.runtime
        .signal("manual-A1", SIGNAL_RESOLVE_MANUAL, DEFAULT_MANUAL_RESOLUTION)
        .await
        .unwrap();
    h.runtime.run_instance("manual-A1").await.unwrap();

    let err = h
        .runtime
        .signal("manual-A1", SIGNAL_RESOLVE_MANUAL, DEFAULT_MANUAL_RESOLUTION)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InstanceClosed { .. }), "{err}");
}

// =============================================================================
// End to end
// =============================================================================

async fn wait_for<F>(events: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>, mut matches: F)
where
    F: FnMut(&RuntimeEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_case_a1_escalates_to_manual_and_concludes() {
    // Three primary attempts and the single stale retry all fail.
    let h = harness(ScriptedFailures::failing(4, "Customer card provider rejected"));
    let mut events = h.runtime.subscribe();

    let worker = Worker::new(h.runtime.clone(), WorkerOptions::default());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker_task = tokio::spawn(async move {
        worker
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
    });

    h.runtime
        .start_workflow::<PrimaryWorkflow>(StartOptions::new("A1", QUEUE_QUERY_ORDER), "A1".to_string())
        .await
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(e, RuntimeEvent::InstanceStarted { instance_id, .. } if instance_id == "manual-A1")
    })
    .await;
    h.runtime
        .signal("manual-A1", SIGNAL_RESOLVE_MANUAL, DEFAULT_MANUAL_RESOLUTION)
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, RuntimeEvent::InstanceCompleted { instance_id, .. } if instance_id == "manual-A1")
    })
    .await;

    stop_tx.send(()).unwrap();
    worker_task.await.unwrap().unwrap();

    for id in ["A1", "stale-A1", "manual-A1"] {
        assert_eq!(
            h.runtime.describe(id).await.unwrap().status,
            InstanceStatus::Completed,
            "{id}"
        );
    }
    assert_eq!(h.failures.calls(), 4);

    let finalized = stale_finalizations(&h.ledger);
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].original_workflow_id, "A1");
    assert_eq!(finalized[0].metadata.resolution, Some(Resolution::MovedToManual));

    let conclusions: Vec<_> = h
        .ledger
        .outcomes()
        .into_iter()
        .filter_map(|o| match o {
            Outcome::OrderConcluded { record, .. } => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(conclusions.len(), 1);
    assert_eq!(conclusions[0].resolution, "manual-resolution");
    assert_eq!(conclusions[0].resolved_by, "manual-intervention");
}
