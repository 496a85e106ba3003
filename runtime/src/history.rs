//! Instance history: recorded outcomes for deterministic replay
//!
//! Every command a workflow issues gets the next sequence number. Its
//! outcome is appended to the instance history under that number. When a
//! workflow is re-run after a restart, commands whose sequence number is
//! already recorded return the recorded outcome instead of executing again.
//!
//! ```text
//! seq 0  ActivityFailed     QueryOrder (3 attempts)
//! seq 1  ClockRead          2025-01-01T00:00:05Z
//! seq 2  ChildStarted       stale-payment-42
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ActivityFailure, RuntimeError};

/// One recorded step of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    ActivityCompleted {
        seq: u64,
        activity: String,
        output: serde_json::Value,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    ActivityFailed {
        seq: u64,
        failure: ActivityFailure,
        timestamp: DateTime<Utc>,
    },

    /// A timer was armed; `fire_at` is absolute so a resumed run waits only
    /// for the remainder.
    TimerStarted {
        seq: u64,
        fire_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    TimerFired {
        seq: u64,
        timestamp: DateTime<Utc>,
    },

    SignalReceived {
        seq: u64,
        channel: String,
        payload: String,
        timestamp: DateTime<Utc>,
    },

    ChildStarted {
        seq: u64,
        kind: String,
        instance_id: String,
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    ChildStartFailed {
        seq: u64,
        kind: String,
        instance_id: String,
        reason: String,
        already_started: bool,
        timestamp: DateTime<Utc>,
    },

    VersionMarker {
        seq: u64,
        change_id: String,
        version: u32,
        timestamp: DateTime<Utc>,
    },

    ClockRead {
        seq: u64,
        at: DateTime<Utc>,
    },
}

impl HistoryEvent {
    /// Command sequence number this event belongs to.
    pub fn seq(&self) -> u64 {
        match self {
            Self::ActivityCompleted { seq, .. }
            | Self::ActivityFailed { seq, .. }
            | Self::TimerStarted { seq, .. }
            | Self::TimerFired { seq, .. }
            | Self::SignalReceived { seq, .. }
            | Self::ChildStarted { seq, .. }
            | Self::ChildStartFailed { seq, .. }
            | Self::VersionMarker { seq, .. }
            | Self::ClockRead { seq, .. } => *seq,
        }
    }

    /// Event type name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::SignalReceived { .. } => "signal_received",
            Self::ChildStarted { .. } => "child_started",
            Self::ChildStartFailed { .. } => "child_start_failed",
            Self::VersionMarker { .. } => "version_marker",
            Self::ClockRead { .. } => "clock_read",
        }
    }
}

/// Command issued by a workflow, used to check recorded events on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command<'a> {
    Activity(&'a str),
    Race,
    SignalWait,
    StartChild(&'a str),
    Version(&'a str),
    Clock,
}

impl Command<'_> {
    fn describe(&self) -> String {
        match self {
            Self::Activity(name) => format!("activity {name}"),
            Self::Race => "signal/timer race".to_string(),
            Self::SignalWait => "signal wait".to_string(),
            Self::StartChild(id) => format!("child start {id}"),
            Self::Version(change_id) => format!("version marker {change_id}"),
            Self::Clock => "clock read".to_string(),
        }
    }

    /// Whether a recorded event can belong to this command.
    fn accepts(&self, event: &HistoryEvent) -> bool {
        match (self, event) {
            (Self::Activity(name), HistoryEvent::ActivityCompleted { activity, .. }) => {
                activity == name
            }
            (Self::Activity(name), HistoryEvent::ActivityFailed { failure, .. }) => {
                failure.activity == *name
            }
            (
                Self::Race,
                HistoryEvent::TimerStarted { .. }
                | HistoryEvent::TimerFired { .. }
                | HistoryEvent::SignalReceived { .. },
            ) => true,
            (Self::SignalWait, HistoryEvent::SignalReceived { .. }) => true,
            (Self::StartChild(id), HistoryEvent::ChildStarted { instance_id, .. })
            | (Self::StartChild(id), HistoryEvent::ChildStartFailed { instance_id, .. }) => {
                instance_id == id
            }
            (Self::Version(id), HistoryEvent::VersionMarker { change_id, .. }) => change_id == id,
            (Self::Clock, HistoryEvent::ClockRead { .. }) => true,
            _ => false,
        }
    }
}

/// Events recorded for `seq`, verified against the command being replayed.
pub(crate) fn recorded_for<'h>(
    instance_id: &str,
    history: &'h [HistoryEvent],
    seq: u64,
    command: Command<'_>,
) -> Result<Vec<&'h HistoryEvent>, RuntimeError> {
    let events: Vec<&HistoryEvent> = history.iter().filter(|e| e.seq() == seq).collect();
    if let Some(mismatch) = events.iter().find(|e| !command.accepts(e)) {
        return Err(RuntimeError::NonDeterminism {
            instance_id: instance_id.to_string(),
            seq,
            expected: command.describe(),
            found: mismatch.event_type().to_string(),
        });
    }
    Ok(events)
}
