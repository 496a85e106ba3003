//! Runtime error types
//!
//! Three layers:
//! - [`ApplicationError`]: what an activity attempt reports back.
//! - [`ActivityFailure`]: what a workflow sees once the retry budget is spent.
//! - [`RuntimeError`] / [`WorkflowError`]: substrate and workflow-level failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::InstanceStatus;
use crate::store::StoreError;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Error reported by a single activity attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationError {
    /// Human-readable failure text.
    pub message: String,
    /// Machine-readable classification.
    pub error_type: String,
    /// Stops the retry loop immediately when set.
    #[serde(default)]
    pub non_retryable: bool,
    /// Structured context for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApplicationError {
    /// Retryable error of the given type.
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            non_retryable: false,
            details: None,
        }
    }

    /// Error that must not be retried.
    pub fn non_retryable(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            non_retryable: true,
            ..Self::new(message, error_type)
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub(crate) fn timeout(kind: &str) -> Self {
        Self::new(format!("activity {kind} timeout"), "Timeout")
    }
}

impl std::fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (type: {}, retryable: {})",
            self.message, self.error_type, !self.non_retryable
        )
    }
}

impl std::error::Error for ApplicationError {}

/// Final failure of an activity after its retry policy is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("activity {activity} failed after {attempts} attempt(s): {cause}")]
pub struct ActivityFailure {
    pub activity: String,
    pub attempts: u32,
    pub cause: ApplicationError,
}

/// Errors raised by the runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instance {instance_id} is already started")]
    AlreadyStarted { instance_id: String },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance {instance_id} is closed ({status})")]
    InstanceClosed {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),

    #[error("no workflow registered for kind {0}")]
    UnknownWorkflow(String),

    #[error("no activity registered with name {0}")]
    UnknownActivity(String),

    #[error("failed to start child instance {instance_id}: {reason}")]
    ChildStartFailed { instance_id: String, reason: String },

    #[error("non-deterministic replay of {instance_id} at command {seq}: expected {expected}, history has {found}")]
    NonDeterminism {
        instance_id: String,
        seq: u64,
        expected: String,
        found: String,
    },

    #[error("schedule already exists: {0}")]
    ScheduleExists(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Whether the error reports a duplicate start rather than a hard failure.
    pub fn is_already_started(&self) -> bool {
        matches!(self, Self::AlreadyStarted { .. })
    }
}

/// Errors a workflow run can end with.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Activity(#[from] ActivityFailure),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("{0}")]
    Application(String),
}

impl WorkflowError {
    /// Whether the error reports a duplicate start of a child instance.
    pub fn is_already_started(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_already_started())
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Runtime(RuntimeError::Serialization(e))
    }
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        Self::Runtime(RuntimeError::Store(e))
    }
}
