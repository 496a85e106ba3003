//! Recurring schedules
//!
//! A schedule starts a fresh instance of one workflow kind every `every`,
//! aligned to multiples of the interval since the Unix epoch, until its
//! action budget is spent.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::StartOptions;

/// When and how often a schedule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub every: Duration,
    /// Remaining firings; 0 means unlimited.
    #[serde(default)]
    pub remaining_actions: u32,
    /// Informational; intervals are absolute.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl ScheduleSpec {
    pub fn every(every: Duration) -> Self {
        Self {
            every,
            remaining_actions: 0,
            time_zone: default_time_zone(),
        }
    }

    pub fn with_remaining_actions(mut self, remaining: u32) -> Self {
        self.remaining_actions = remaining;
        self
    }

    pub fn with_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }
}

/// Persisted schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub workflow_kind: String,
    pub input: serde_json::Value,
    /// Template for every started instance; its id is the id prefix.
    pub start: StartOptions,
    pub spec: ScheduleSpec,
    pub next_fire_at: DateTime<Utc>,
    #[serde(default)]
    pub actions_taken: u32,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub fn new(
        schedule_id: impl Into<String>,
        workflow_kind: impl Into<String>,
        start: StartOptions,
        spec: ScheduleSpec,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            workflow_kind: workflow_kind.into(),
            input,
            start,
            next_fire_at: next_aligned(now, spec.every),
            spec,
            actions_taken: 0,
            created_at: now,
        }
    }

    /// Whether the action budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.spec.remaining_actions != 0 && self.actions_taken >= self.spec.remaining_actions
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_exhausted() && self.next_fire_at <= now
    }

    /// Instance id for the firing at `fire_at`.
    pub fn instance_id_for(&self, fire_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}",
            self.start.instance_id,
            fire_at.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }

    /// Record one firing and move to the next aligned slot after `now`.
    /// Missed slots are skipped rather than replayed.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.actions_taken += 1;
        self.next_fire_at = next_aligned(now, self.spec.every);
    }
}

/// First multiple of `every` since the epoch strictly after `now`.
pub fn next_aligned(now: DateTime<Utc>, every: Duration) -> DateTime<Utc> {
    let step = (every.as_millis() as i64).max(1);
    let now_ms = now.timestamp_millis();
    let next_ms = (now_ms.div_euclid(step) + 1) * step;
    Utc.timestamp_millis_opt(next_ms).single().unwrap_or(now)
}
