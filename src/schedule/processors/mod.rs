pub mod command;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::protocol::client::RpcClient;
use crate::schedule::types::{ClaimedTask, TaskType};
use crate::watchdog::Heartbeat;

pub use command::CommandProcessor;

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn task_type(&self) -> TaskType;
    /// Runs the task to completion and returns its result.
    async fn process(&self, task: &ClaimedTask, ctx: &TaskContext) -> Result<Value>;
}

/// Where interim progress goes.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, task_id: &str, progress: u8, partial: Option<Value>) -> crate::error::Result<()>;
}

#[async_trait]
impl ProgressSink for RpcClient {
    async fn progress(&self, task_id: &str, progress: u8, partial: Option<Value>) -> crate::error::Result<()> {
        self.update_task_progress(task_id, progress, partial).await
    }
}

/// Everything a processor may touch while running one task.
pub struct TaskContext {
    // shared by every task of the same dependency chain
    pub work_dir: PathBuf,
    progress: Arc<dyn ProgressSink>,
    heartbeat: Heartbeat,
}

impl TaskContext {
    pub fn new(work_dir: PathBuf, progress: Arc<dyn ProgressSink>, heartbeat: Heartbeat) -> Self {
        Self {
            work_dir,
            progress,
            heartbeat,
        }
    }

    /// Records progress and counts as a watchdog heartbeat. A failed report is
    /// logged and otherwise ignored.
    pub async fn report_progress(&self, task_id: &str, progress: u8, partial: Option<Value>) {
        self.heartbeat.beat();
        if let Err(e) = self.progress.progress(task_id, progress, partial).await {
            warn!(task_id, "Failed to report progress: {}", e);
        }
    }
}
