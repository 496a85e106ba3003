//! Escalation Runtime
//!
//! An embedded durable-execution substrate for long-running, signal-driven
//! processes. Instances are persisted after every step and replayed from
//! their recorded history when a worker restarts.
//!
//! # Modules
//!
//! - [`retry`]: retry policies and per-invocation activity options
//! - [`activity`]: the [`Activity`] trait and invoke-with-retry
//! - [`workflow`]: the [`Workflow`] trait and the [`Registry`]
//! - [`context`]: [`WorkflowContext`], the commands a workflow may issue
//! - [`history`]: recorded events used for replay
//! - [`engine`]: the [`Runtime`] client handle
//! - [`worker`]: the polling [`Worker`]
//! - [`store`]: in-memory and file-backed persistence
//! - [`schedule`]: recurring starts aligned to the epoch
//! - [`namespace`]: tenant registration
//! - [`events`]: broadcast runtime events

pub mod activity;
pub mod clock;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod instance;
pub mod namespace;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod worker;
pub mod workflow;

pub use activity::{Activity, ActivityContext, ActivityInfo};
pub use context::{RaceOutcome, WorkflowContext, WorkflowInfo};
pub use engine::{Runtime, RuntimeBuilder};
pub use error::{ActivityFailure, ApplicationError, RuntimeError, RuntimeResult, WorkflowError};
pub use events::{EventBus, RuntimeEvent, SharedEventBus};
pub use history::HistoryEvent;
pub use instance::{
    InstanceRecord, InstanceStatus, ParentRef, SearchAttributes, StartAck, StartOptions,
};
pub use namespace::{NamespaceError, NamespaceInfo, NamespaceManager, DEFAULT_NAMESPACE};
pub use retry::{ActivityOptions, RetryPolicy};
pub use schedule::{ScheduleRecord, ScheduleSpec};
pub use store::{FileStore, MemoryStore, SharedStore, Store, StoreError};
pub use worker::{Worker, WorkerOptions};
pub use workflow::{Registry, Workflow};
