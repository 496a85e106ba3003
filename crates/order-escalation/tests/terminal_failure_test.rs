//! Integration tests for the paths that end a tier in failure
//!
//! A failed delegation, an exhausted finalization and an exhausted
//! conclusion each close their own instance as `Failed` and report it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use escalation_runtime::store::{PendingSignal, StoreResult};
use escalation_runtime::{
    InstanceRecord, InstanceStatus, MemoryStore, Runtime, RuntimeError, RuntimeEvent,
    ScheduleRecord, SharedStore, StartOptions, Store, StoreError,
};
use order_escalation::app::{self, Dependencies};
use order_escalation::ledger::{LedgerError, LedgerResult, Outcome, OutcomeLedger, SharedLedger};
use order_escalation::models::{
    EscalationRecord, ManualRecord, RecordMetadata, PRIMARY_FAILURE_REASON, QUEUE_MANUAL_HANDLE,
    QUEUE_QUERY_ORDER, QUEUE_STALE_ORDER, SIGNAL_RESOLVE_MANUAL, SIGNAL_RESOLVE_STALE,
};
use order_escalation::workflows::{ManualHandleWorkflow, PrimaryWorkflow, StaleWorkflow};
use order_escalation::{MemoryLedger, NeverFail, ScriptedFailures};
use tokio::time::Instant;

/// Ledger that rejects every write and remembers when each one came in.
#[derive(Default)]
struct BrokenLedger {
    attempts: Mutex<Vec<Instant>>,
}

impl BrokenLedger {
    fn gaps(&self) -> Vec<Duration> {
        let attempts = self.attempts.lock().unwrap();
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl OutcomeLedger for BrokenLedger {
    async fn record(&self, _outcome: &Outcome) -> LedgerResult<()> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(LedgerError::Io(std::io::Error::other("read-only file system")))
    }
}

/// Memory store that refuses to create instances whose id starts with
/// `prefix`.
struct RefusingStore {
    inner: MemoryStore,
    prefix: &'static str,
}

#[async_trait]
impl Store for RefusingStore {
    async fn create_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        if record.instance_id.starts_with(self.prefix) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.create_instance(record).await
    }

    async fn save_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        self.inner.save_instance(record).await
    }

    async fn load_instance(&self, instance_id: &str) -> StoreResult<Option<InstanceRecord>> {
        self.inner.load_instance(instance_id).await
    }

    async fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        self.inner.list_instances().await
    }

    async fn delete_instance(&self, instance_id: &str) -> StoreResult<bool> {
        self.inner.delete_instance(instance_id).await
    }

    async fn push_signal(&self, instance_id: &str, signal: &PendingSignal) -> StoreResult<()> {
        self.inner.push_signal(instance_id, signal).await
    }

    async fn take_signal(
        &self,
        instance_id: &str,
        channel: &str,
    ) -> StoreResult<Option<PendingSignal>> {
        self.inner.take_signal(instance_id, channel).await
    }

    async fn clear_signals(&self, instance_id: &str) -> StoreResult<usize> {
        self.inner.clear_signals(instance_id).await
    }

    async fn decide_version(&self, key: &str, default: u32) -> StoreResult<u32> {
        self.inner.decide_version(key, default).await
    }

    async fn claim_instance(&self, instance_id: &str, run_id: &str) -> StoreResult<bool> {
        self.inner.claim_instance(instance_id, run_id).await
    }

    async fn create_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<bool> {
        self.inner.create_schedule(schedule).await
    }

    async fn save_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<()> {
        self.inner.save_schedule(schedule).await
    }

    async fn load_schedule(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRecord>> {
        self.inner.load_schedule(schedule_id).await
    }

    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleRecord>> {
        self.inner.list_schedules().await
    }

    async fn delete_schedule(&self, schedule_id: &str) -> StoreResult<bool> {
        self.inner.delete_schedule(schedule_id).await
    }
}

fn runtime(store: SharedStore, deps: &Dependencies) -> Runtime {
    Runtime::builder(store).registry(app::registry(deps)).build()
}

fn broken_ledger_runtime() -> (Runtime, Arc<BrokenLedger>) {
    let ledger = Arc::new(BrokenLedger::default());
    let shared: SharedLedger = ledger.clone();
    let deps = Dependencies::new(Arc::new(NeverFail), shared);
    (runtime(MemoryStore::new().shared(), &deps), ledger)
}

fn failed_instances(events: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>) -> Vec<String> {
    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::InstanceFailed { instance_id, .. } = event {
            failed.push(instance_id);
        }
    }
    failed
}

fn assert_finalization_backoff(ledger: &BrokenLedger) {
    assert_eq!(ledger.attempts(), 3);
    let gaps = ledger.gaps();
    assert_eq!(gaps.len(), 2);
    for (gap, expected) in gaps.iter().zip([5000u64, 7500]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(100),
            "{gaps:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_stale_start_fails_primary() {
    let store = Arc::new(RefusingStore {
        inner: MemoryStore::new(),
        prefix: "stale-",
    });
    let failures = ScriptedFailures::failing(3, "Order not found").shared();
    let deps = Dependencies::new(failures.clone(), MemoryLedger::new().shared());
    let rt = runtime(store, &deps);
    let mut events = rt.subscribe();

    rt.start_workflow::<PrimaryWorkflow>(StartOptions::new("A1", QUEUE_QUERY_ORDER), "A1".to_string())
        .await
        .unwrap();
    assert_eq!(rt.run_instance("A1").await.unwrap(), InstanceStatus::Failed);
    assert_eq!(failures.calls(), 3);

    let primary = rt.describe("A1").await.unwrap();
    assert!(primary.output.is_none());
    let failure = primary.failure.unwrap();
    assert!(failure.contains("stale-A1"), "{failure}");
    assert!(failure.contains("disk full"), "{failure}");
    assert!(matches!(
        rt.describe("stale-A1").await,
        Err(RuntimeError::InstanceNotFound(_))
    ));
    assert_eq!(failed_instances(&mut events), ["A1"]);

    // Closed for good: running it again does not retry the lookup.
    assert_eq!(rt.run_instance("A1").await.unwrap(), InstanceStatus::Failed);
    assert_eq!(failures.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_finalization_failure_fails_stale_instance() {
    let (rt, ledger) = broken_ledger_runtime();
    let mut events = rt.subscribe();
    rt.start_workflow::<StaleWorkflow>(
        StartOptions::new("stale-A1", QUEUE_STALE_ORDER),
        EscalationRecord {
            order_id: "A1".to_string(),
            original_workflow_id: "A1".to_string(),
            original_run_id: "run-1".to_string(),
            failure_reason: PRIMARY_FAILURE_REASON.to_string(),
            failure_time: Utc::now(),
            max_attempts_reached: 3,
            original_error: "Order not found".to_string(),
            metadata: RecordMetadata::new("QueryOrderWorkflow"),
        },
    )
    .await
    .unwrap();
    rt.signal("stale-A1", SIGNAL_RESOLVE_STALE, "refund approved")
        .await
        .unwrap();

    assert_eq!(rt.run_instance("stale-A1").await.unwrap(), InstanceStatus::Failed);
    let failure = rt.describe("stale-A1").await.unwrap().failure.unwrap();
    assert!(
        failure.contains("FinalizeStaleWorkflow failed after 3 attempt(s)"),
        "{failure}"
    );
    assert!(failure.contains("read-only file system"), "{failure}");
    assert_finalization_backoff(&ledger);
    assert_eq!(failed_instances(&mut events), ["stale-A1"]);
}

#[tokio::test(start_paused = true)]
async fn test_conclusion_failure_fails_manual_instance() {
    let (rt, ledger) = broken_ledger_runtime();
    let mut events = rt.subscribe();
    rt.start_workflow::<ManualHandleWorkflow>(
        StartOptions::new("manual-A1", QUEUE_MANUAL_HANDLE),
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
        },
    )
    .await
    .unwrap();
    rt.signal("manual-A1", SIGNAL_RESOLVE_MANUAL, "refund issued")
        .await
        .unwrap();

    assert_eq!(rt.run_instance("manual-A1").await.unwrap(), InstanceStatus::Failed);
    let failure = rt.describe("manual-A1").await.unwrap().failure.unwrap();
    assert!(
        failure.contains("ConcludeQueryOrder failed after 3 attempt(s)"),
        "{failure}"
    );
    assert_finalization_backoff(&ledger);
    assert_eq!(failed_instances(&mut events), ["manual-A1"]);
}
