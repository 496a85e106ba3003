//! Runtime: client handle for starting, signalling and running instances
//!
//! A [`Runtime`] is bound to one namespace and one store. It is cheap to
//! clone; clones share the store, registry, event bus and signal mailboxes.
//!
//! ```text
//! start_workflow ──► store (Pending) ──► Worker::poll ──► run_instance
//!                                                          │
//! signal ──► store inbox ──► mailbox.notify ──────────────►│ WorkflowContext
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::context::WorkflowContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::events::{EventBus, RuntimeEvent, SharedEventBus};
use crate::instance::{
    validate_instance_id, InstanceRecord, InstanceStatus, ParentRef, StartAck, StartOptions,
};
use crate::namespace::DEFAULT_NAMESPACE;
use crate::schedule::{ScheduleRecord, ScheduleSpec};
use crate::store::{PendingSignal, SharedStore, StoreError};
use crate::workflow::{Registry, Workflow};

/// How often a waiting instance re-checks the store for signals delivered
/// by another process.
const DEFAULT_SIGNAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Inner {
    namespace: String,
    store: SharedStore,
    registry: Registry,
    events: SharedEventBus,
    clock: Clock,
    signal_poll_interval: Duration,
    mailboxes: Mutex<HashMap<String, Arc<Notify>>>,
    dispatch: Notify,
}

/// Client and execution handle for one namespace.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    store: SharedStore,
    namespace: String,
    registry: Registry,
    events: Option<SharedEventBus>,
    clock: Option<Clock>,
    signal_poll_interval: Duration,
}

impl RuntimeBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a clock with another runtime over the same store.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn signal_poll_interval(mut self, interval: Duration) -> Self {
        self.signal_poll_interval = interval;
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            inner: Arc::new(Inner {
                namespace: self.namespace,
                store: self.store,
                registry: self.registry,
                events: self.events.unwrap_or_else(|| EventBus::new().shared()),
                clock: self.clock.unwrap_or_default(),
                signal_poll_interval: self.signal_poll_interval,
                mailboxes: Mutex::new(HashMap::new()),
                dispatch: Notify::new(),
            }),
        }
    }
}

impl Runtime {
    pub fn builder(store: SharedStore) -> RuntimeBuilder {
        RuntimeBuilder {
            store,
            namespace: DEFAULT_NAMESPACE.to_string(),
            registry: Registry::new(),
            events: None,
            clock: None,
            signal_poll_interval: DEFAULT_SIGNAL_POLL_INTERVAL,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Subscribe to runtime events
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn signal_poll_interval(&self) -> Duration {
        self.inner.signal_poll_interval
    }

    pub(crate) fn mailbox(&self, instance_id: &str) -> Arc<Notify> {
        match self.inner.mailboxes.lock() {
            Ok(mut mailboxes) => mailboxes
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone(),
            // Waiters fall back to polling the store.
            Err(_) => Arc::new(Notify::new()),
        }
    }

    /// Wake the instance if it is executing in this process. Instances
    /// running elsewhere pick the signal up from the store.
    fn notify_mailbox(&self, instance_id: &str) {
        if let Ok(mailboxes) = self.inner.mailboxes.lock() {
            if let Some(mailbox) = mailboxes.get(instance_id) {
                mailbox.notify_one();
            }
        }
    }

    fn release_mailbox(&self, instance_id: &str) {
        if let Ok(mut mailboxes) = self.inner.mailboxes.lock() {
            mailboxes.remove(instance_id);
        }
    }

    /// Resolves when new work may be available for a worker.
    pub(crate) async fn dispatch_notified(&self) {
        self.inner.dispatch.notified().await;
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    /// Start a new instance of `W`.
    ///
    /// Fails with [`RuntimeError::AlreadyStarted`] if an instance with the same
    /// id exists and has not failed.
    pub async fn start_workflow<W: Workflow>(
        &self,
        options: StartOptions,
        input: W::Input,
    ) -> RuntimeResult<StartAck> {
        let input = serde_json::to_value(input)?;
        self.start_kind(W::KIND, options, input, None).await
    }

    pub(crate) async fn start_kind(
        &self,
        kind: &str,
        options: StartOptions,
        input: serde_json::Value,
        parent: Option<ParentRef>,
    ) -> RuntimeResult<StartAck> {
        validate_instance_id(&options.instance_id)?;
        let mut record = InstanceRecord::new(self.namespace(), kind, options, input);
        if let Some(parent) = parent {
            record = record.with_parent(parent);
        }

        self.store()
            .create_instance(&record)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists { instance_id, .. } => {
                    RuntimeError::AlreadyStarted { instance_id }
                }
                other => RuntimeError::Store(other),
            })?;

        info!(
            namespace = self.namespace(),
            instance_id = %record.instance_id,
            run_id = %record.run_id,
            kind,
            task_queue = %record.task_queue,
            "Instance started"
        );
        self.inner.events.publish(RuntimeEvent::InstanceStarted {
            instance_id: record.instance_id.clone(),
            run_id: record.run_id.clone(),
            kind: kind.to_string(),
            parent_id: record.parent.as_ref().map(|p| p.instance_id.clone()),
            timestamp: self.now(),
        });
        self.inner.dispatch.notify_one();
        Ok(record.ack())
    }

    /// Deliver `payload` to `channel` of a running instance.
    ///
    /// The signal is buffered until the instance reads the channel and is
    /// discarded if the instance closes first.
    pub async fn signal(&self, instance_id: &str, channel: &str, payload: &str) -> RuntimeResult<()> {
        let record = self.describe(instance_id).await?;
        if record.status.is_closed() {
            return Err(RuntimeError::InstanceClosed {
                instance_id: instance_id.to_string(),
                status: record.status,
            });
        }

        let sent_at = self.now();
        self.store()
            .push_signal(instance_id, &PendingSignal::new(channel, payload, sent_at))
            .await?;
        self.notify_mailbox(instance_id);

        info!(instance_id, channel, "Signal sent");
        self.inner.events.publish(RuntimeEvent::SignalSent {
            instance_id: instance_id.to_string(),
            channel: channel.to_string(),
            timestamp: sent_at,
        });
        Ok(())
    }

    /// Current record of an instance.
    pub async fn describe(&self, instance_id: &str) -> RuntimeResult<InstanceRecord> {
        self.store()
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| RuntimeError::InstanceNotFound(instance_id.to_string()))
    }

    pub async fn list_instances(&self) -> RuntimeResult<Vec<InstanceRecord>> {
        Ok(self.store().list_instances().await?)
    }

    /// Register a schedule that starts `W` every `spec.every`.
    pub async fn create_schedule<W: Workflow>(
        &self,
        schedule_id: &str,
        start: StartOptions,
        spec: ScheduleSpec,
        input: W::Input,
    ) -> RuntimeResult<ScheduleRecord> {
        validate_instance_id(schedule_id)?;
        validate_instance_id(&start.instance_id)?;
        let schedule = ScheduleRecord::new(
            schedule_id,
            W::KIND,
            start,
            spec,
            serde_json::to_value(input)?,
            self.now(),
        );
        if !self.store().create_schedule(&schedule).await? {
            return Err(RuntimeError::ScheduleExists(schedule_id.to_string()));
        }
        info!(
            schedule_id,
            kind = W::KIND,
            every = ?schedule.spec.every,
            next_fire_at = %schedule.next_fire_at,
            "Schedule created"
        );
        Ok(schedule)
    }

    /// Remove a schedule. Instances it already started are unaffected.
    pub async fn delete_schedule(&self, schedule_id: &str) -> RuntimeResult<()> {
        if !self.store().delete_schedule(schedule_id).await? {
            return Err(RuntimeError::ScheduleNotFound(schedule_id.to_string()));
        }
        info!(schedule_id, "Schedule deleted");
        Ok(())
    }

    pub async fn list_schedules(&self) -> RuntimeResult<Vec<ScheduleRecord>> {
        Ok(self.store().list_schedules().await?)
    }

    /// Start one instance for every schedule due at `now`.
    pub async fn fire_due_schedules(&self, now: DateTime<Utc>) -> RuntimeResult<Vec<StartAck>> {
        let mut started = Vec::new();
        for mut schedule in self.store().list_schedules().await? {
            if schedule.is_exhausted() {
                self.store().delete_schedule(&schedule.schedule_id).await?;
                continue;
            }
            if !schedule.is_due(now) {
                continue;
            }

            let options = StartOptions {
                instance_id: schedule.instance_id_for(schedule.next_fire_at),
                ..schedule.start.clone()
            };
            match self
                .start_kind(
                    &schedule.workflow_kind,
                    options,
                    schedule.input.clone(),
                    None,
                )
                .await
            {
                Ok(ack) => {
                    self.inner.events.publish(RuntimeEvent::ScheduleFired {
                        schedule_id: schedule.schedule_id.clone(),
                        instance_id: ack.instance_id.clone(),
                        timestamp: now,
                    });
                    started.push(ack);
                }
                Err(e) if e.is_already_started() => {
                    debug!(schedule_id = %schedule.schedule_id, "Scheduled instance already started");
                }
                Err(e) => {
                    // The term is not spent; the next tick tries again.
                    warn!(schedule_id = %schedule.schedule_id, error = %e, "Scheduled start failed");
                    continue;
                }
            }

            schedule.advance(now);
            // Deleted while firing: do not resurrect.
            if self
                .store()
                .load_schedule(&schedule.schedule_id)
                .await?
                .is_none()
            {
                continue;
            }
            if schedule.is_exhausted() {
                info!(schedule_id = %schedule.schedule_id, "Schedule exhausted");
                self.store().delete_schedule(&schedule.schedule_id).await?;
            } else {
                self.store().save_schedule(&schedule).await?;
            }
        }
        Ok(started)
    }

    /// Delete closed instances that closed before `cutoff`.
    pub async fn prune_closed(&self, cutoff: DateTime<Utc>) -> RuntimeResult<usize> {
        let mut pruned = 0;
        for record in self.store().list_instances().await? {
            let expired = record.status.is_closed()
                && record.closed_at.is_some_and(|closed| closed < cutoff);
            if expired && self.store().delete_instance(&record.instance_id).await? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, %cutoff, "Pruned closed instances");
        }
        Ok(pruned)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run an instance to completion, replaying any recorded history.
    ///
    /// Returns the terminal status. Failing to persist history leaves the
    /// instance running so a later worker can resume it.
    pub async fn run_instance(&self, instance_id: &str) -> RuntimeResult<InstanceStatus> {
        let mut record = self.describe(instance_id).await?;
        if record.status.is_closed() {
            return Ok(record.status);
        }

        let resumed = !record.history.is_empty();
        if record.status != InstanceStatus::Running {
            record.status = InstanceStatus::Running;
            record.updated_at = Utc::now();
            self.store().save_instance(&record).await?;
        }
        if resumed {
            info!(instance_id, events = record.history.len(), "Resuming instance");
            self.inner.events.publish(RuntimeEvent::InstanceResumed {
                instance_id: instance_id.to_string(),
                recorded_events: record.history.len(),
                timestamp: self.now(),
            });
        }

        let Some(workflow) = self.registry().workflow(&record.kind) else {
            let error = RuntimeError::UnknownWorkflow(record.kind.clone());
            error!(instance_id, error = %error, "Cannot run instance");
            record.close(Err(error.to_string()));
            return self.finish(record).await;
        };

        let kind = record.kind.clone();
        let input = record.input.clone();
        let mut ctx = WorkflowContext::new(self.clone(), record);
        let outcome = workflow.run_json(&mut ctx, input).await;
        let mut record = ctx.into_record();

        match outcome {
            Ok(output) => record.close(Ok(output)),
            Err(crate::error::WorkflowError::Runtime(RuntimeError::Store(e))) => {
                error!(instance_id, kind = %kind, error = %e, "Store failure; instance left running");
                return Err(RuntimeError::Store(e));
            }
            Err(e) => record.close(Err(e.to_string())),
        }
        self.finish(record).await
    }

    async fn finish(&self, record: InstanceRecord) -> RuntimeResult<InstanceStatus> {
        self.store().save_instance(&record).await?;
        let dropped = self.store().clear_signals(&record.instance_id).await?;
        self.release_mailbox(&record.instance_id);
        if dropped > 0 {
            debug!(instance_id = %record.instance_id, dropped, "Discarded unconsumed signals");
        }

        let timestamp = self.now();
        match (&record.status, &record.failure) {
            (InstanceStatus::Failed, failure) => {
                let error = failure.clone().unwrap_or_default();
                warn!(
                    instance_id = %record.instance_id,
                    kind = %record.kind,
                    error = %error,
                    "Instance failed"
                );
                self.inner.events.publish(RuntimeEvent::InstanceFailed {
                    instance_id: record.instance_id.clone(),
                    kind: record.kind.clone(),
                    error,
                    timestamp,
                });
            }
            _ => {
                info!(instance_id = %record.instance_id, kind = %record.kind, "Instance completed");
                self.inner.events.publish(RuntimeEvent::InstanceCompleted {
                    instance_id: record.instance_id.clone(),
                    kind: record.kind.clone(),
                    timestamp,
                });
            }
        }
        Ok(record.status)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("namespace", &self.inner.namespace)
            .field("registry", &self.inner.registry)
            .finish()
    }
}
