//! WorkflowContext: the only door from workflow code to the outside world
//!
//! Every method issues one command with the next sequence number. If the
//! instance history already holds an outcome for that number, the outcome is
//! returned as recorded; otherwise the command runs and its outcome is
//! appended and persisted before the method returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::activity::{invoke_with_retry, Activity, Invocation};
use crate::engine::Runtime;
use crate::error::{RuntimeError, RuntimeResult, WorkflowError};
use crate::events::RuntimeEvent;
use crate::history::{recorded_for, Command, HistoryEvent};
use crate::instance::{InstanceRecord, ParentRef, SearchAttributes, StartAck, StartOptions};
use crate::retry::ActivityOptions;
use crate::store::version_key;
use crate::workflow::Workflow;

/// Which side of a signal/timer race fired first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome {
    Signal(String),
    TimerFired,
}

/// Identity of the running instance.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub instance_id: String,
    pub run_id: String,
    pub kind: String,
    pub namespace: String,
    pub task_queue: String,
    pub started_at: DateTime<Utc>,
    pub parent: Option<ParentRef>,
    pub search_attributes: SearchAttributes,
}

pub struct WorkflowContext {
    runtime: Runtime,
    record: InstanceRecord,
    next_seq: u64,
    mailbox: Arc<Notify>,
}

impl WorkflowContext {
    pub(crate) fn new(runtime: Runtime, record: InstanceRecord) -> Self {
        let mailbox = runtime.mailbox(&record.instance_id);
        Self {
            runtime,
            record,
            next_seq: 0,
            mailbox,
        }
    }

    pub(crate) fn into_record(self) -> InstanceRecord {
        self.record
    }

    pub fn info(&self) -> WorkflowInfo {
        WorkflowInfo {
            instance_id: self.record.instance_id.clone(),
            run_id: self.record.run_id.clone(),
            kind: self.record.kind.clone(),
            namespace: self.record.namespace.clone(),
            task_queue: self.record.task_queue.clone(),
            started_at: self.record.created_at,
            parent: self.record.parent.clone(),
            search_attributes: self.record.search_attributes.clone(),
        }
    }

    /// Whether the next command will be answered from history.
    pub fn is_replaying(&self) -> bool {
        self.record
            .last_seq()
            .is_some_and(|last| self.next_seq <= last)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn recorded(&self, seq: u64, command: Command<'_>) -> RuntimeResult<Vec<HistoryEvent>> {
        let events = recorded_for(&self.record.instance_id, &self.record.history, seq, command)?;
        Ok(events.into_iter().cloned().collect())
    }

    async fn record_event(&mut self, event: HistoryEvent) -> RuntimeResult<()> {
        debug!(
            instance_id = %self.record.instance_id,
            seq = event.seq(),
            event_type = event.event_type(),
            "Recording history event"
        );
        self.record.history.push(event);
        self.record.updated_at = Utc::now();
        self.runtime.store().save_instance(&self.record).await?;
        Ok(())
    }

    /// Wait until a signal may have arrived, or at most `limit`.
    async fn wait_for_signal(&self, limit: Duration) {
        let wait = limit.min(self.runtime.signal_poll_interval());
        tokio::select! {
            () = self.mailbox.notified() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Current time, recorded on first execution.
    pub async fn now(&mut self) -> Result<DateTime<Utc>, WorkflowError> {
        let seq = self.take_seq();
        for event in self.recorded(seq, Command::Clock)? {
            if let HistoryEvent::ClockRead { at, .. } = event {
                return Ok(at);
            }
        }
        let at = self.runtime.now();
        self.record_event(HistoryEvent::ClockRead { seq, at }).await?;
        Ok(at)
    }

    /// Invoke activity `A` with retry. The final failure surfaces as
    /// [`WorkflowError::Activity`].
    pub async fn execute_activity<A: Activity>(
        &mut self,
        options: &ActivityOptions,
        input: A::Input,
    ) -> Result<A::Output, WorkflowError> {
        let seq = self.take_seq();
        for event in self.recorded(seq, Command::Activity(A::NAME))? {
            match event {
                HistoryEvent::ActivityCompleted { output, .. } => {
                    return Ok(serde_json::from_value(output)?);
                }
                HistoryEvent::ActivityFailed { failure, .. } => return Err(failure.into()),
                _ => {}
            }
        }

        let activity = self
            .runtime
            .registry()
            .activity(A::NAME)
            .ok_or_else(|| RuntimeError::UnknownActivity(A::NAME.to_string()))?;
        let input = serde_json::to_value(input)?;
        let clock = self.runtime.clock();
        let now = move || clock.now();

        let outcome = invoke_with_retry(
            &activity,
            options,
            input,
            Invocation {
                activity: A::NAME,
                activity_id: format!("{}:{seq}", self.record.instance_id),
                instance_id: &self.record.instance_id,
                events: self.runtime.events(),
                now: &now,
            },
        )
        .await;

        match outcome {
            Ok((output, attempts)) => {
                self.record_event(HistoryEvent::ActivityCompleted {
                    seq,
                    activity: A::NAME.to_string(),
                    output: output.clone(),
                    attempts,
                    timestamp: clock.now(),
                })
                .await?;
                Ok(serde_json::from_value(output)?)
            }
            Err(failure) => {
                self.record_event(HistoryEvent::ActivityFailed {
                    seq,
                    failure: failure.clone(),
                    timestamp: clock.now(),
                })
                .await?;
                Err(failure.into())
            }
        }
    }

    /// Arm a timer and listen on `channel`; whichever fires first wins.
    ///
    /// A signal sent after the deadline loses even if it is read first. The
    /// send time comes from the signalling process's clock, so processes
    /// sharing a store should run on [`Clock::host`](crate::clock::Clock::host).
    pub async fn race_signal_timer(
        &mut self,
        channel: &str,
        delay: Duration,
    ) -> Result<RaceOutcome, WorkflowError> {
        let seq = self.take_seq();
        let mut armed = None;
        for event in self.recorded(seq, Command::Race)? {
            match event {
                HistoryEvent::SignalReceived { payload, .. } => {
                    return Ok(RaceOutcome::Signal(payload));
                }
                HistoryEvent::TimerFired { .. } => return Ok(RaceOutcome::TimerFired),
                HistoryEvent::TimerStarted { fire_at, .. } => armed = Some(fire_at),
                _ => {}
            }
        }

        let fire_at = match armed {
            Some(fire_at) => fire_at,
            None => {
                let now = self.runtime.now();
                let delay = chrono::Duration::from_std(delay).map_err(|_| {
                    WorkflowError::Application(format!("timer delay out of range: {delay:?}"))
                })?;
                let fire_at = now + delay;
                self.record_event(HistoryEvent::TimerStarted {
                    seq,
                    fire_at,
                    timestamp: now,
                })
                .await?;
                fire_at
            }
        };

        let instance_id = self.record.instance_id.clone();
        loop {
            let mut late_signal = false;
            if let Some(signal) = self.runtime.store().take_signal(&instance_id, channel).await? {
                if signal.sent_at <= fire_at {
                    self.record_event(HistoryEvent::SignalReceived {
                        seq,
                        channel: channel.to_string(),
                        payload: signal.payload.clone(),
                        timestamp: self.runtime.now(),
                    })
                    .await?;
                    self.publish_signal_received(channel);
                    info!(instance_id = %instance_id, channel, "Signal won the race");
                    return Ok(RaceOutcome::Signal(signal.payload));
                }
                debug!(instance_id = %instance_id, channel, "Signal sent after the timer deadline");
                late_signal = true;
            }

            let remaining = self.runtime.clock().until(fire_at);
            if late_signal || remaining.is_zero() {
                let now = self.runtime.now();
                self.record_event(HistoryEvent::TimerFired { seq, timestamp: now })
                    .await?;
                self.runtime.events().publish(RuntimeEvent::TimerFired {
                    instance_id: instance_id.clone(),
                    seq,
                    timestamp: now,
                });
                info!(instance_id = %instance_id, channel, "Timer won the race");
                return Ok(RaceOutcome::TimerFired);
            }

            self.wait_for_signal(remaining).await;
        }
    }

    /// Wait without bound for the next signal on `channel`.
    pub async fn receive_signal(&mut self, channel: &str) -> Result<String, WorkflowError> {
        let seq = self.take_seq();
        for event in self.recorded(seq, Command::SignalWait)? {
            if let HistoryEvent::SignalReceived { payload, .. } = event {
                return Ok(payload);
            }
        }

        let instance_id = self.record.instance_id.clone();
        loop {
            if let Some(signal) = self.runtime.store().take_signal(&instance_id, channel).await? {
                self.record_event(HistoryEvent::SignalReceived {
                    seq,
                    channel: channel.to_string(),
                    payload: signal.payload.clone(),
                    timestamp: self.runtime.now(),
                })
                .await?;
                self.publish_signal_received(channel);
                return Ok(signal.payload);
            }
            self.wait_for_signal(Duration::MAX).await;
        }
    }

    fn publish_signal_received(&self, channel: &str) {
        self.runtime.events().publish(RuntimeEvent::SignalReceived {
            instance_id: self.record.instance_id.clone(),
            channel: channel.to_string(),
            timestamp: self.runtime.now(),
        });
    }

    /// Start a detached instance of `W`. Only an acknowledgement comes back;
    /// the child's outcome is never observed by this instance.
    ///
    /// A duplicate id fails with [`RuntimeError::AlreadyStarted`].
    pub async fn start_child<W: Workflow>(
        &mut self,
        options: StartOptions,
        input: W::Input,
    ) -> Result<StartAck, WorkflowError> {
        let seq = self.take_seq();
        let child_id = options.instance_id.clone();
        for event in self.recorded(seq, Command::StartChild(&child_id))? {
            match event {
                HistoryEvent::ChildStarted {
                    instance_id,
                    run_id,
                    ..
                } => return Ok(StartAck { instance_id, run_id }),
                HistoryEvent::ChildStartFailed {
                    instance_id,
                    reason,
                    already_started,
                    ..
                } => {
                    let error = if already_started {
                        RuntimeError::AlreadyStarted { instance_id }
                    } else {
                        RuntimeError::ChildStartFailed {
                            instance_id,
                            reason,
                        }
                    };
                    return Err(error.into());
                }
                _ => {}
            }
        }

        let parent = ParentRef {
            instance_id: self.record.instance_id.clone(),
            run_id: self.record.run_id.clone(),
        };
        let input = serde_json::to_value(input)?;
        let started = self
            .runtime
            .start_kind(W::KIND, options, input, Some(parent))
            .await;

        match started {
            Ok(ack) => {
                self.record_event(HistoryEvent::ChildStarted {
                    seq,
                    kind: W::KIND.to_string(),
                    instance_id: ack.instance_id.clone(),
                    run_id: ack.run_id.clone(),
                    timestamp: self.runtime.now(),
                })
                .await?;
                Ok(ack)
            }
            Err(e) => {
                // A store failure is fatal for the child start; only failing
                // to record it leaves this instance running.
                let (e, reason) = match e {
                    RuntimeError::Store(cause) => {
                        let reason = cause.to_string();
                        let e = RuntimeError::ChildStartFailed {
                            instance_id: child_id.clone(),
                            reason: reason.clone(),
                        };
                        (e, reason)
                    }
                    other => {
                        let reason = other.to_string();
                        (other, reason)
                    }
                };
                self.record_event(HistoryEvent::ChildStartFailed {
                    seq,
                    kind: W::KIND.to_string(),
                    instance_id: child_id,
                    reason,
                    already_started: e.is_already_started(),
                    timestamp: self.runtime.now(),
                })
                .await?;
                Err(e.into())
            }
        }
    }

    /// Version frozen for `(change_id, case_id)`, freezing `default_max` on
    /// first use. Later runs of the same case see the same value even after
    /// `default_max` changes.
    pub async fn recorded_version(
        &mut self,
        change_id: &str,
        case_id: &str,
        default_max: u32,
    ) -> Result<u32, WorkflowError> {
        let seq = self.take_seq();
        for event in self.recorded(seq, Command::Version(change_id))? {
            if let HistoryEvent::VersionMarker { version, .. } = event {
                return Ok(version);
            }
        }

        let version = self
            .runtime
            .store()
            .decide_version(&version_key(change_id, case_id), default_max)
            .await?;
        self.record_event(HistoryEvent::VersionMarker {
            seq,
            change_id: change_id.to_string(),
            version,
            timestamp: self.runtime.now(),
        })
        .await?;
        Ok(version)
    }
}
