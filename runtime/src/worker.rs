//! Worker: polls a namespace for runnable instances and drives them
//!
//! On start the worker resumes instances a previous worker left `Running`
//! on its task queues. It then loops until shutdown: claim pending
//! instances, fire due schedules, prune closed instances past retention.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::engine::Runtime;
use crate::error::RuntimeResult;
use crate::instance::{InstanceRecord, InstanceStatus};

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Queues this worker serves. Empty means every queue.
    pub task_queues: Vec<String>,
    /// Instances executing at once.
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    /// Fire due schedules from this worker.
    pub run_schedules: bool,
    /// Closed instances older than this are deleted.
    pub retention: Option<chrono::Duration>,
    pub prune_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            task_queues: Vec::new(),
            max_concurrent: 100,
            poll_interval: Duration::from_millis(500),
            run_schedules: true,
            retention: None,
            prune_interval: Duration::from_secs(3600),
        }
    }
}

impl WorkerOptions {
    pub fn with_task_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_schedules(mut self, enabled: bool) -> Self {
        self.run_schedules = enabled;
        self
    }

    fn serves(&self, record: &InstanceRecord) -> bool {
        self.task_queues.is_empty() || self.task_queues.iter().any(|q| *q == record.task_queue)
    }
}

/// Removes an instance from the active set when its task ends.
struct ActiveGuard {
    instance_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.instance_id);
        }
    }
}

pub struct Worker {
    runtime: Runtime,
    options: WorkerOptions,
    active: Arc<Mutex<HashSet<String>>>,
    slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(runtime: Runtime, options: WorkerOptions) -> Self {
        let slots = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            runtime,
            options,
            active: Arc::new(Mutex::new(HashSet::new())),
            slots,
        }
    }

    /// Instances currently executing on this worker.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn is_active(&self, instance_id: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(instance_id))
            .unwrap_or(true)
    }

    /// Run until `shutdown` resolves. In-flight instances are left running
    /// and resume on the next start.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            namespace = self.runtime.namespace(),
            task_queues = ?self.options.task_queues,
            max_concurrent = self.options.max_concurrent,
            "Worker started"
        );
        let resumed = self.resume_orphans().await?;
        if resumed > 0 {
            info!(resumed, "Resumed interrupted instances");
        }

        tokio::pin!(shutdown);
        let mut last_prune = tokio::time::Instant::now();
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Poll failed");
            }
            if self.options.run_schedules {
                if let Err(e) = self.runtime.fire_due_schedules(self.runtime.now()).await {
                    warn!(error = %e, "Schedule firing failed");
                }
            }
            if let Some(retention) = self.options.retention {
                if last_prune.elapsed() >= self.options.prune_interval {
                    last_prune = tokio::time::Instant::now();
                    if let Err(e) = self.runtime.prune_closed(self.runtime.now() - retention).await {
                        warn!(error = %e, "Prune failed");
                    }
                }
            }

            tokio::select! {
                () = &mut shutdown => break,
                () = self.runtime.dispatch_notified() => {}
                () = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        info!(active = self.active_count(), "Worker stopped");
        Ok(())
    }

    /// Spawn every `Running` instance on this worker's queues that is not
    /// already executing here.
    pub async fn resume_orphans(&self) -> RuntimeResult<usize> {
        let mut resumed = 0;
        for record in self.runtime.list_instances().await? {
            if record.status == InstanceStatus::Running
                && self.options.serves(&record)
                && !self.is_active(&record.instance_id)
            {
                if !self.spawn(record.instance_id).await {
                    break;
                }
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Claim and spawn pending instances. Returns how many were spawned.
    pub async fn poll_once(&self) -> RuntimeResult<usize> {
        let mut spawned = 0;
        for record in self.runtime.list_instances().await? {
            if record.status != InstanceStatus::Pending || !self.options.serves(&record) {
                continue;
            }
            if self.slots.available_permits() == 0 {
                debug!("All worker slots busy");
                break;
            }
            if !self
                .runtime
                .store()
                .claim_instance(&record.instance_id, &record.run_id)
                .await?
            {
                continue;
            }
            if self.spawn(record.instance_id).await {
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    async fn spawn(&self, instance_id: String) -> bool {
        let Ok(permit) = self.slots.clone().acquire_owned().await else {
            return false;
        };
        match self.active.lock() {
            Ok(mut active) => {
                active.insert(instance_id.clone());
            }
            Err(_) => return false,
        }
        let guard = ActiveGuard {
            instance_id: instance_id.clone(),
            active: self.active.clone(),
        };
        let runtime = self.runtime.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            if let Err(e) = runtime.run_instance(&instance_id).await {
                error!(instance_id = %instance_id, error = %e, "Instance execution aborted");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowContext;
    use crate::error::WorkflowError;
    use crate::events::RuntimeEvent;
    use crate::instance::StartOptions;
    use crate::store::MemoryStore;
    use crate::workflow::{Registry, Workflow};
    use async_trait::async_trait;

    struct Nap;

    #[async_trait]
    impl Workflow for Nap {
        const KIND: &'static str = "Nap";
        type Input = u64;
        type Output = ();

        async fn run(&self, ctx: &mut WorkflowContext, secs: u64) -> Result<(), WorkflowError> {
            ctx.race_signal_timer("wake", Duration::from_secs(secs)).await?;
            Ok(())
        }
    }

    fn runtime() -> Runtime {
        let mut registry = Registry::new();
        registry.register_workflow(Nap);
        Runtime::builder(MemoryStore::new().shared())
            .registry(registry)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_runs_only_its_queues() {
        let rt = runtime();
        rt.start_workflow::<Nap>(StartOptions::new("nap-1", "mine"), 5)
            .await
            .unwrap();
        rt.start_workflow::<Nap>(StartOptions::new("nap-2", "theirs"), 5)
            .await
            .unwrap();

        let worker = Worker::new(rt.clone(), WorkerOptions::default().with_task_queues(["mine"]));
        assert_eq!(worker.poll_once().await.unwrap(), 1);
        assert_eq!(worker.poll_once().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rt.describe("nap-1").await.unwrap().status, InstanceStatus::Completed);
        assert_eq!(rt.describe("nap-2").await.unwrap().status, InstanceStatus::Pending);
        assert_eq!(worker.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_defers_work() {
        let rt = runtime();
        for i in 0..3 {
            rt.start_workflow::<Nap>(StartOptions::new(format!("nap-{i}"), "q"), 5)
                .await
                .unwrap();
        }
        let worker = Worker::new(rt.clone(), WorkerOptions::default().with_max_concurrent(2));
        assert_eq!(worker.poll_once().await.unwrap(), 2);
        assert_eq!(worker.active_count(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(worker.poll_once().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let rt = runtime();
        let mut events = rt.subscribe();
        rt.start_workflow::<Nap>(StartOptions::new("nap-1", "q"), 1)
            .await
            .unwrap();

        let worker = Worker::new(rt.clone(), WorkerOptions::default());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            worker
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        loop {
            if let RuntimeEvent::InstanceCompleted { instance_id, .. } = events.recv().await.unwrap() {
                assert_eq!(instance_id, "nap-1");
                break;
            }
        }
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
