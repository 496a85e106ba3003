//! Workflows and the registry that maps names to implementations

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::activity::{Activity, ActivityAdapter, ErasedActivity};
use crate::context::WorkflowContext;
use crate::error::WorkflowError;

/// A durable, replayable state machine.
///
/// `run` must branch only on its input and on values returned by the
/// [`WorkflowContext`]. Anything else (wall clock, randomness, environment)
/// breaks replay after a restart.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Registration name, stored on every instance record.
    const KIND: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(
        &self,
        ctx: &mut WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}

#[async_trait]
pub(crate) trait ErasedWorkflow: Send + Sync {
    async fn run_json(
        &self,
        ctx: &mut WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError>;
}

struct WorkflowAdapter<W>(W);

#[async_trait]
impl<W: Workflow> ErasedWorkflow for WorkflowAdapter<W> {
    async fn run_json(
        &self,
        ctx: &mut WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        let input: W::Input = serde_json::from_value(input)?;
        let output = self.0.run(ctx, input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Workflow and activity implementations known to a worker.
#[derive(Clone, Default)]
pub struct Registry {
    workflows: HashMap<&'static str, Arc<dyn ErasedWorkflow>>,
    activities: HashMap<&'static str, Arc<dyn ErasedActivity>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under [`Workflow::KIND`], replacing any previous one.
    pub fn register_workflow<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        self.workflows
            .insert(W::KIND, Arc::new(WorkflowAdapter(workflow)));
        self
    }

    /// Register an activity under [`Activity::NAME`], replacing any previous one.
    pub fn register_activity<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities
            .insert(A::NAME, Arc::new(ActivityAdapter(activity)));
        self
    }

    pub fn has_workflow(&self, kind: &str) -> bool {
        self.workflows.contains_key(kind)
    }

    pub fn has_activity(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    /// Registered workflow kinds, sorted.
    pub fn workflow_kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.workflows.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub(crate) fn workflow(&self, kind: &str) -> Option<Arc<dyn ErasedWorkflow>> {
        self.workflows.get(kind).cloned()
    }

    pub(crate) fn activity(&self, name: &str) -> Option<Arc<dyn ErasedActivity>> {
        self.activities.get(name).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut activities: Vec<&&str> = self.activities.keys().collect();
        activities.sort();
        f.debug_struct("Registry")
            .field("workflows", &self.workflow_kinds())
            .field("activities", &activities)
            .finish()
    }
}
