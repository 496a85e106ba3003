//! Persistence for instances, signals, version decisions and schedules
//!
//! Two implementations share the [`Store`] trait:
//!
//! - [`MemoryStore`]: process-local, used by tests and embedded runs.
//! - [`FileStore`]: JSON documents under `<root>/<namespace>/`, shareable by
//!   a worker process and CLI clients.
//!
//! # Layout (file store)
//!
//! ```text
//! <root>/<namespace>/
//!   namespace.json
//!   instances/<instance-id>.json
//!   signals/<instance-id>/<nanos>-<uuid>.json
//!   versions/<change-id>.<case-id>.json
//!   schedules/<schedule-id>.json
//! ```

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{InstanceRecord, InstanceStatus};
use crate::schedule::ScheduleRecord;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Instance {instance_id} already exists ({status})")]
    AlreadyExists {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Namespace not registered: {0}")]
    NamespaceNotFound(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a store
pub type SharedStore = Arc<dyn Store>;

/// A signal waiting to be consumed by its instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSignal {
    pub signal_id: String,
    pub channel: String,
    pub payload: String,
    pub sent_at: DateTime<Utc>,
}

impl PendingSignal {
    pub fn new(
        channel: impl Into<String>,
        payload: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            signal_id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            payload: payload.into(),
            sent_at,
        }
    }
}

/// Storage backend for one namespace.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new instance. Fails with [`StoreError::AlreadyExists`] when an
    /// instance with the same id exists and has not failed; a failed one is
    /// replaced.
    async fn create_instance(&self, record: &InstanceRecord) -> StoreResult<()>;

    /// Overwrite an existing instance.
    async fn save_instance(&self, record: &InstanceRecord) -> StoreResult<()>;

    async fn load_instance(&self, instance_id: &str) -> StoreResult<Option<InstanceRecord>>;

    /// All instances, ordered by creation time.
    async fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>>;

    /// Remove an instance and its pending signals. Returns whether it existed.
    async fn delete_instance(&self, instance_id: &str) -> StoreResult<bool>;

    async fn push_signal(&self, instance_id: &str, signal: &PendingSignal) -> StoreResult<()>;

    /// Remove and return the oldest pending signal on `channel`.
    async fn take_signal(
        &self,
        instance_id: &str,
        channel: &str,
    ) -> StoreResult<Option<PendingSignal>>;

    /// Drop every pending signal for an instance. Returns how many were dropped.
    async fn clear_signals(&self, instance_id: &str) -> StoreResult<usize>;

    /// Return the version frozen under `key`, freezing `default` if none exists.
    async fn decide_version(&self, key: &str, default: u32) -> StoreResult<u32>;

    /// Move a pending instance of run `run_id` to running. Returns false when
    /// another worker claimed it first or the run is gone.
    async fn claim_instance(&self, instance_id: &str, run_id: &str) -> StoreResult<bool>;

    /// Insert a schedule. Returns false if the id is taken.
    async fn create_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<bool>;

    async fn save_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<()>;

    async fn load_schedule(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRecord>>;

    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleRecord>>;

    /// Returns whether the schedule existed.
    async fn delete_schedule(&self, schedule_id: &str) -> StoreResult<bool>;
}

/// Key under which a version decision is frozen.
pub fn version_key(change_id: &str, case_id: &str) -> String {
    format!("{change_id}.{case_id}")
}

/// Whether an existing record blocks a new start with the same id.
pub(crate) fn blocks_restart(existing: &InstanceRecord) -> bool {
    existing.status != InstanceStatus::Failed
}
