use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::ToolCommand;
use crate::error::{QueueError, Result};
use crate::protocol::client::RpcClient;
use crate::schedule::processors::{TaskContext, TaskProcessor};
use crate::schedule::types::{ClaimedTask, LogLevel, Task, TaskStatus, TaskType};
use crate::watchdog::{Heartbeat, WorkerStatus};

const LOG_SOURCE: &str = "worker";
// upper bound on tasks visited when walking a dependency tree
const MAX_CHAIN_TASKS: usize = 4096;

/// Retry applied to the store calls made after a claim, so a short store
/// outage does not leave a claimed task in `processing`.
#[derive(Debug, Clone)]
pub struct WriteRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

pub struct TaskWorker {
    client: Arc<RpcClient>,
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
    heartbeat: Heartbeat,
    // parent of the per-chain working directories
    work_dir: PathBuf,
    // how long to wait after an empty claim. e.g. 1 second
    interval: Duration,
    retry: WriteRetry,
}

impl TaskWorker {
    pub fn new(client: Arc<RpcClient>, heartbeat: Heartbeat, work_dir: PathBuf) -> Self {
        Self {
            client,
            processors: HashMap::new(),
            heartbeat,
            work_dir,
            interval: Duration::from_secs(1),
            retry: WriteRetry::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_write_retry(mut self, retry: WriteRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn register_processor(&mut self, processor: Arc<dyn TaskProcessor>) {
        info!("Registered processor for {}", processor.task_type());
        self.processors.insert(processor.task_type(), processor);
    }

    /// Runs the one-time install command under the `installing` status.
    pub async fn install(&self, command: &ToolCommand) -> anyhow::Result<()> {
        self.heartbeat.set_status(WorkerStatus::Installing);
        info!("Running install command {}", command.program);

        let status = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to start {}", command.program))?;

        self.heartbeat.set_status(WorkerStatus::Idle);
        if !status.success() {
            bail!("install command {} exited with {}", command.program, status);
        }
        info!("Install command finished");
        Ok(())
    }

    /// Claims and runs tasks until `shutdown` resolves. A task still running at
    /// that point is stopped and recorded as failed before this returns.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.heartbeat.set_status(WorkerStatus::Idle);
        let (stop_tx, mut stop) = watch::channel(false);

        let work = async move {
            while !*stop.borrow() {
                let pause = match self.run_one(&mut stop).await {
                    Ok(true) => continue, // continue to process next task
                    Ok(false) => self.interval,
                    Err(e) if e.is_unreachable() => {
                        warn!("Store service unavailable: {}", e);
                        self.interval
                    }
                    Err(e) => {
                        error!("Error processing task: {}", e);
                        Duration::from_millis(100)
                    }
                };
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = stopped(&mut stop) => {}
                }
            }
        };
        tokio::pin!(work);
        tokio::pin!(shutdown);

        tokio::select! {
            _ = &mut work => return,
            _ = &mut shutdown => {}
        }
        info!("Stopping worker");
        let _ = stop_tx.send(true);
        work.await;
    }

    /// Claims and runs one task. `Ok(false)` when nothing was claimable.
    pub async fn process_next_task(&self) -> Result<bool> {
        let (_stop_tx, mut stop) = watch::channel(false);
        self.run_one(&mut stop).await
    }

    async fn run_one(&self, stop: &mut watch::Receiver<bool>) -> Result<bool> {
        let outcome = self.claim_and_process(stop).await;
        self.heartbeat.set_status(WorkerStatus::Idle);
        outcome
    }

    async fn claim_and_process(&self, stop: &mut watch::Receiver<bool>) -> Result<bool> {
        let Some(task) = self.client.claim_task().await? else {
            return Ok(false);
        };

        self.heartbeat.set_status(WorkerStatus::Busy);
        info!(task_id = %task.task_id, task_type = %task.task_type, "Processing task");

        // from here on the task must reach a terminal status
        let root = self.retrying("get_task", || self.chain_root(&task.task_id)).await;
        let result = match &root {
            Ok(root) => {
                let work_dir = self.work_dir.join(root);
                tokio::select! {
                    result = self.execute(&task, &work_dir) => result,
                    _ = stopped(stop) => Err(anyhow!("worker stopped before the task finished")),
                }
            }
            Err(e) => Err(anyhow!("failed to resolve chain directory: {}", e)),
        };

        match result {
            Ok(value) => {
                self.finish(&task.task_id, TaskStatus::Completed, value).await?;
                self.log(LogLevel::Info, &format!("task {} completed", task.task_id)).await;
                info!(task_id = %task.task_id, "Task completed");
            }
            Err(e) => {
                error!(task_id = %task.task_id, "Task failed: {:#}", e);
                self.finish(&task.task_id, TaskStatus::Failed, json!({ "error": format!("{:#}", e) }))
                    .await?;
                self.log(LogLevel::Error, &format!("task {} failed: {:#}", task.task_id, e))
                    .await;
                self.fail_dependents(&task.task_id).await?;
            }
        }

        if let Ok(root) = root {
            self.cleanup_chain(&root).await;
        }
        Ok(true)
    }

    async fn execute(&self, task: &ClaimedTask, work_dir: &Path) -> anyhow::Result<Value> {
        let processor = self
            .processors
            .get(&task.task_type)
            .ok_or_else(|| anyhow!("no processor registered for task type {}", task.task_type))?;

        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("failed to create {}", work_dir.display()))?;

        let ctx = TaskContext::new(work_dir.to_path_buf(), self.client.clone(), self.heartbeat.clone());
        processor.process(task, &ctx).await
    }

    /// Calls `call` again while the store is unreachable, up to the configured attempts.
    async fn retrying<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.retry.backoff;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_unreachable() && attempt < self.retry.attempts => {
                    warn!(op, attempt, "Store call failed, retrying: {}", e);
                    sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Records the terminal status of a claimed task.
    async fn finish(&self, task_id: &str, status: TaskStatus, result: Value) -> Result<()> {
        let written = self
            .retrying("update_task_status", || {
                self.client.update_task_status(task_id, status, Some(result.clone()))
            })
            .await;
        match written {
            // an earlier attempt was applied but its reply was lost
            Err(QueueError::InvalidTransition { from, .. }) if from == status => Ok(()),
            other => other,
        }
    }

    /// The first task of the dependency chain `task_id` belongs to.
    async fn chain_root(&self, task_id: &str) -> Result<String> {
        let mut root = task_id.to_string();
        for _ in 0..MAX_CHAIN_TASKS {
            match self.client.get_task(&root).await? {
                Some(Task {
                    depends_on: Some(parent),
                    ..
                }) => root = parent,
                _ => break,
            }
        }
        Ok(root)
    }

    async fn dependents_of(&self, task_id: &str) -> Result<Vec<Task>> {
        self.retrying("list_dependent_tasks", || self.client.list_dependent_tasks(task_id))
            .await
    }

    /// Marks every pending task that transitively waits on `failed_task_id` as failed.
    async fn fail_dependents(&self, failed_task_id: &str) -> Result<()> {
        let reason = json!({ "error": format!("dependency {} failed", failed_task_id) });
        let mut queue = VecDeque::from([failed_task_id.to_string()]);
        let mut visited = 0;

        while let Some(parent) = queue.pop_front() {
            visited += 1;
            if visited > MAX_CHAIN_TASKS {
                warn!(task_id = failed_task_id, "Dependency tree too large, not failing further dependents");
                break;
            }
            for dependent in self.dependents_of(&parent).await? {
                if dependent.status == TaskStatus::Pending {
                    let written = self
                        .retrying("update_task_status", || {
                            self.client
                                .update_task_status(&dependent.task_id, TaskStatus::Failed, Some(reason.clone()))
                        })
                        .await;
                    match written {
                        Ok(()) => {
                            warn!(task_id = %dependent.task_id, parent = %failed_task_id, "Dependent task failed");
                            self.log(
                                LogLevel::Warning,
                                &format!("task {} failed: dependency {} failed", dependent.task_id, failed_task_id),
                            )
                            .await;
                        }
                        Err(QueueError::InvalidTransition { from, .. }) => {
                            debug!(task_id = %dependent.task_id, %from, "Dependent already left pending")
                        }
                        Err(e) => return Err(e),
                    }
                }
                queue.push_back(dependent.task_id);
            }
        }
        Ok(())
    }

    /// True while any task below `root` is still pending or processing.
    async fn chain_active(&self, root: &str) -> Result<bool> {
        let mut queue = VecDeque::from([root.to_string()]);
        let mut visited = 0;

        while let Some(parent) = queue.pop_front() {
            visited += 1;
            if visited > MAX_CHAIN_TASKS {
                return Ok(true);
            }
            for dependent in self.dependents_of(&parent).await? {
                if !dependent.status.is_terminal() {
                    return Ok(true);
                }
                queue.push_back(dependent.task_id);
            }
        }
        Ok(false)
    }

    // the directory goes once nothing in the chain can still run
    async fn cleanup_chain(&self, root: &str) {
        match self.chain_active(root).await {
            Ok(true) => debug!(root, "Chain still active, keeping its directory"),
            Ok(false) => remove_dir(&self.work_dir.join(root)).await,
            Err(e) => warn!(root, "Could not inspect chain, keeping its directory: {}", e),
        }
    }

    async fn log(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.client.append_log(LOG_SOURCE, level, message).await {
            warn!("Failed to append system log: {}", e);
        }
    }
}

// Resolves once a stop is requested; never if the sender went away without one.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}
