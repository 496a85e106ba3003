//! Records passed between escalation tiers
//!
//! Each tier hands the next one a copy of its record at the moment of
//! delegation. Contextual tags travel in [`RecordMetadata`], a typed builder
//! that every stage enriches before forwarding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Names
// =============================================================================

pub const QUEUE_QUERY_ORDER: &str = "query-order";
pub const QUEUE_STALE_ORDER: &str = "stale-order";
pub const QUEUE_MANUAL_HANDLE: &str = "manual-handle";
pub const QUEUE_RECURRING_SCHEDULE: &str = "recurring-schedule";

/// Every queue a combined worker serves.
pub const ALL_QUEUES: [&str; 4] = [
    QUEUE_QUERY_ORDER,
    QUEUE_STALE_ORDER,
    QUEUE_MANUAL_HANDLE,
    QUEUE_RECURRING_SCHEDULE,
];

pub const SIGNAL_RESOLVE_STALE: &str = "resolve-stale-workflow";
pub const SIGNAL_RESOLVE_MANUAL: &str = "resolve-manual-order";

/// Payload sent by `signal-manual` when none is given.
pub const DEFAULT_MANUAL_RESOLUTION: &str = "manual-resolution";
pub const RESOLVED_BY_MANUAL: &str = "manual-intervention";

pub const PRIMARY_FAILURE_REASON: &str = "QueryOrderActivity failed after maximum retries";
pub const STALE_FAILURE_REASON: &str = "Stale workflow retry failed after delay";

/// Instance id of the primary process for an order.
pub fn primary_id(order_id: &str) -> String {
    format!("payment-{order_id}")
}

/// Instance id of the escalation process for a primary instance.
pub fn stale_id(primary_id: &str) -> String {
    format!("stale-{primary_id}")
}

/// Instance id of the manual process for a primary instance.
pub fn manual_id(primary_id: &str) -> String {
    format!("manual-{primary_id}")
}

// =============================================================================
// Resolution
// =============================================================================

/// Final disposition of an escalated case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    Success,
    Failed,
    RetrySucceeded,
    ManualResolve,
    MovedToStale,
    MovedToManual,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RetrySucceeded => "retry-succeeded",
            Self::ManualResolve => "manual-resolve",
            Self::MovedToStale => "moved-to-stale",
            Self::MovedToManual => "moved-to-manual",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a case has been escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationLevel {
    StaleRetry,
    ManualInterventionRequired,
}

// =============================================================================
// Metadata
// =============================================================================

/// Current layout of [`RecordMetadata`]. Bump when a field changes meaning.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Typed context carried alongside escalation records.
///
/// Fields are only ever added as a record moves down the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub schema_version: u32,
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_level: Option<EscalationLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Operator text that accompanied a manual resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RecordMetadata {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            workflow_type: workflow_type.into(),
            task_queue: None,
            namespace: None,
            original_start_time: None,
            stale_start_time: None,
            original_failure_reason: None,
            escalation_level: None,
            resolution: None,
            resolution_note: None,
            resolved_at: None,
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_original_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.original_start_time = Some(at);
        self
    }

    pub fn with_stale_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.stale_start_time = Some(at);
        self
    }

    pub fn with_original_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.original_failure_reason = Some(reason.into());
        self
    }

    pub fn with_escalation_level(mut self, level: EscalationLevel) -> Self {
        self.escalation_level = Some(level);
        self
    }

    /// Stamp the final disposition.
    pub fn resolved(
        mut self,
        resolution: Option<Resolution>,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        self.resolution = resolution;
        self.resolution_note = note;
        self.resolved_at = Some(at);
        self
    }

    /// Resolution tag, `"unknown"` when none was reached.
    pub fn resolution_label(&self) -> &'static str {
        self.resolution.map_or("unknown", Resolution::as_str)
    }
}

// =============================================================================
// Records
// =============================================================================

/// Handed from the primary process to the escalation process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub order_id: String,
    pub original_workflow_id: String,
    pub original_run_id: String,
    pub failure_reason: String,
    pub failure_time: DateTime<Utc>,
    pub max_attempts_reached: u32,
    #[serde(default)]
    pub original_error: String,
    pub metadata: RecordMetadata,
}

/// Handed from the escalation process to the manual process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualRecord {
    pub order_id: String,
    pub original_workflow_id: String,
    pub original_run_id: String,
    pub stale_workflow_id: String,
    pub original_failure_reason: String,
    pub failure_reason: String,
    pub stale_failure_time: DateTime<Utc>,
    #[serde(default)]
    pub original_error: String,
    #[serde(default)]
    pub stale_retry_error: String,
    pub metadata: RecordMetadata,
}

/// Final outcome written by the manual process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConclusionRecord {
    pub order_id: String,
    pub resolution: String,
    pub original_workflow_id: String,
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: String,
}

// =============================================================================
// Payment versions
// =============================================================================

/// Highest payment variant new cases are pinned to.
pub const CURRENT_PAYMENT_VERSION: u32 = 3;

/// Recurring payment variants. New variants are appended, never edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentVersion {
    V1,
    V2,
    V3,
}

impl PaymentVersion {
    pub fn from_number(version: u32) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Amount charged per run.
    pub fn amount(self) -> f64 {
        match self {
            Self::V1 => 10.00,
            Self::V2 => 15.00,
            Self::V3 => 20.00,
        }
    }
}

impl std::fmt::Display for PaymentVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}
