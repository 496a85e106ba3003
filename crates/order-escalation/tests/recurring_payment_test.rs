//! Integration tests for recurring payment dispatch and its schedule

use std::sync::Arc;
use std::time::Duration;

use escalation_runtime::clock::Clock;
use escalation_runtime::{
    InstanceStatus, MemoryStore, Runtime, RuntimeEvent, ScheduleSpec, SharedStore, StartOptions,
    Worker, WorkerOptions,
};
use order_escalation::app::{self, Dependencies};
use order_escalation::ledger::{MemoryLedger, Outcome};
use order_escalation::models::QUEUE_RECURRING_SCHEDULE;
use order_escalation::workflows::RecurringPaymentWorkflow;
use order_escalation::NeverFail;

fn runtime(store: SharedStore, ledger: Arc<MemoryLedger>, version: u32, clock: Option<Clock>) -> Runtime {
    let mut deps = Dependencies::new(Arc::new(NeverFail), ledger);
    deps.payment_version = version;
    deps.payment_delay = Duration::from_secs(1);
    let builder = Runtime::builder(store).registry(app::registry(&deps));
    match clock {
        Some(clock) => builder.clock(clock).build(),
        None => builder.build(),
    }
}

async fn charge(rt: &Runtime, instance_id: &str, consent_id: &str) -> String {
    rt.start_workflow::<RecurringPaymentWorkflow>(
        StartOptions::new(instance_id, QUEUE_RECURRING_SCHEDULE),
        consent_id.to_string(),
    )
    .await
    .unwrap();
    assert_eq!(rt.run_instance(instance_id).await.unwrap(), InstanceStatus::Completed);
    serde_json::from_value(rt.describe(instance_id).await.unwrap().output.unwrap()).unwrap()
}

fn charged_versions(ledger: &MemoryLedger) -> Vec<(String, u32)> {
    ledger
        .outcomes()
        .into_iter()
        .filter_map(|o| match o {
            Outcome::PaymentProcessed {
                consent_id, version, ..
            } => Some((consent_id, version)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_consent_stays_on_its_first_version() {
    let store = MemoryStore::new().shared();
    let ledger = MemoryLedger::new().shared();

    let v1 = runtime(store.clone(), ledger.clone(), 1, None);
    assert_eq!(
        charge(&v1, "C9-1", "C9").await,
        "Payment of $10.00 processed successfully"
    );

    // A deploy raises the default; C9 keeps charging the v1 amount.
    let v3 = runtime(store, ledger.clone(), 3, Some(v1.clock()));
    assert_eq!(
        charge(&v3, "C9-2", "C9").await,
        "Payment of $10.00 processed successfully"
    );
    assert_eq!(
        charge(&v3, "D1-1", "D1").await,
        "Payment of $20.00 processed successfully"
    );

    assert_eq!(
        charged_versions(&ledger),
        [
            ("C9".to_string(), 1),
            ("C9".to_string(), 1),
            ("D1".to_string(), 3)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_schedule_fires_until_terms_are_spent() {
    let store = MemoryStore::new().shared();
    let ledger = MemoryLedger::new().shared();
    let rt = runtime(store, ledger.clone(), 2, None);
    let mut events = rt.subscribe();

    rt.create_schedule::<RecurringPaymentWorkflow>(
        "C9",
        StartOptions::new("C9", QUEUE_RECURRING_SCHEDULE),
        ScheduleSpec::every(Duration::from_secs(60)).with_remaining_actions(2),
        "C9".to_string(),
    )
    .await
    .unwrap();

    let worker = Worker::new(rt.clone(), WorkerOptions::default());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker_task = tokio::spawn(async move {
        worker
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let mut completed = Vec::new();
    tokio::time::timeout(Duration::from_secs(600), async {
        while completed.len() < 2 {
            if let RuntimeEvent::InstanceCompleted { instance_id, kind, .. } = events.recv().await.unwrap() {
                assert_eq!(kind, "RegisterRecurringPayment");
                completed.push(instance_id);
            }
        }
    })
    .await
    .unwrap();

    stop_tx.send(()).unwrap();
    worker_task.await.unwrap().unwrap();

    assert_ne!(completed[0], completed[1]);
    assert!(completed.iter().all(|id| id.starts_with("C9-")));
    assert!(rt.list_schedules().await.unwrap().is_empty(), "exhausted schedule is removed");
    assert_eq!(
        charged_versions(&ledger),
        [("C9".to_string(), 2), ("C9".to_string(), 2)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_schedule_stops_charging() {
    let store = MemoryStore::new().shared();
    let ledger = MemoryLedger::new().shared();
    let rt = runtime(store, ledger.clone(), 3, None);

    rt.create_schedule::<RecurringPaymentWorkflow>(
        "C9",
        StartOptions::new("C9", QUEUE_RECURRING_SCHEDULE),
        ScheduleSpec::every(Duration::from_secs(60)),
        "C9".to_string(),
    )
    .await
    .unwrap();
    rt.delete_schedule("C9").await.unwrap();
    assert!(rt.delete_schedule("C9").await.is_err());

    tokio::time::sleep(Duration::from_secs(180)).await;
    assert!(rt.fire_due_schedules(rt.now()).await.unwrap().is_empty());
    assert!(rt.list_instances().await.unwrap().is_empty());
    assert!(ledger.outcomes().is_empty());
}
