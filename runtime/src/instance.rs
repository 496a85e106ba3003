//! Instance records: the persisted state of one workflow run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::history::HistoryEvent;

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Accepted, waiting for a worker.
    Pending,
    /// Owned by a worker (or interrupted while owned).
    Running,
    /// Terminal: workflow returned Ok.
    Completed,
    /// Terminal: workflow returned an error.
    Failed,
}

impl InstanceStatus {
    /// Whether this is a terminal status.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Indexed attributes attached to an instance for lookup and triage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchAttributes {
    /// Business key (order or consent id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// Free keyword, e.g. environment or escalation stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    /// Numeric priority; higher tiers use higher values.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
}

/// Options for starting an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    pub instance_id: String,
    pub task_queue: String,
    #[serde(default)]
    pub search_attributes: SearchAttributes,
}

impl StartOptions {
    pub fn new(instance_id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_queue: task_queue.into(),
            search_attributes: SearchAttributes::default(),
        }
    }

    pub fn with_search_attributes(mut self, attributes: SearchAttributes) -> Self {
        self.search_attributes = attributes;
        self
    }
}

/// Acknowledgement of an accepted start. Carries identity only; there is
/// nothing to await on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAck {
    pub instance_id: String,
    pub run_id: String,
}

/// Reference from a detached child back to the instance that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub instance_id: String,
    pub run_id: String,
}

/// Persisted state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub run_id: String,
    pub kind: String,
    pub namespace: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub status: InstanceStatus,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
    #[serde(default)]
    pub search_attributes: SearchAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Fresh pending record with a new run id.
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        options: StartOptions,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: options.instance_id,
            run_id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            namespace: namespace.into(),
            task_queue: options.task_queue,
            input,
            status: InstanceStatus::Pending,
            history: Vec::new(),
            search_attributes: options.search_attributes,
            parent: None,
            output: None,
            failure: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn ack(&self) -> StartAck {
        StartAck {
            instance_id: self.instance_id.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Move to a terminal status.
    pub fn close(&mut self, outcome: Result<serde_json::Value, String>) {
        let now = Utc::now();
        match outcome {
            Ok(output) => {
                self.status = InstanceStatus::Completed;
                self.output = Some(output);
            }
            Err(failure) => {
                self.status = InstanceStatus::Failed;
                self.failure = Some(failure);
            }
        }
        self.updated_at = now;
        self.closed_at = Some(now);
    }

    /// Highest command sequence number present in history.
    pub fn last_seq(&self) -> Option<u64> {
        self.history.iter().map(HistoryEvent::seq).max()
    }

    /// One-line summary for logging
    pub fn summary(&self) -> String {
        format!(
            "instance={} kind={} status={} events={}",
            self.instance_id,
            self.kind,
            self.status,
            self.history.len()
        )
    }
}

/// Reject ids that cannot double as store keys.
pub fn validate_instance_id(instance_id: &str) -> RuntimeResult<()> {
    let invalid = instance_id.trim().is_empty()
        || instance_id.starts_with('.')
        || instance_id.contains(['/', '\\'])
        || instance_id.chars().any(char::is_control);
    if invalid {
        return Err(RuntimeError::InvalidInstanceId(instance_id.to_string()));
    }
    Ok(())
}
