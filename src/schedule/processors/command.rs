use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{TaskContext, TaskProcessor};
use crate::config::ToolCommand;
use crate::schedule::types::{ClaimedTask, TaskType};

const LINE_BUFFER: usize = 64;

/// One line of tool output that the worker understands. Anything else is plain log output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ToolEvent {
    Progress {
        progress: f64,
        #[serde(default)]
        partial: Option<Value>,
    },
    Result {
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
    },
}

impl ToolEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

fn clamp_progress(progress: f64) -> u8 {
    if progress.is_nan() {
        return 0;
    }
    progress.clamp(0.0, 100.0).round() as u8
}

/// Runs an external program for one task type:
/// `program args… --task-id <id> --work-dir <dir> --payload <json>`.
pub struct CommandProcessor {
    task_type: TaskType,
    command: ToolCommand,
}

impl CommandProcessor {
    pub fn new(task_type: TaskType, command: ToolCommand) -> Self {
        Self { task_type, command }
    }
}

#[async_trait]
impl TaskProcessor for CommandProcessor {
    fn task_type(&self) -> TaskType {
        self.task_type.clone()
    }

    async fn process(&self, task: &ClaimedTask, ctx: &TaskContext) -> Result<Value> {
        let payload = serde_json::to_string(&task.payload)?;
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg("--task-id")
            .arg(&task.task_id)
            .arg("--work-dir")
            .arg(&ctx.work_dir)
            .arg("--payload")
            .arg(&payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.command.program))?;

        let stdout = child.stdout.take().context("tool stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            let task_id = task.task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, "tool: {}", line);
                }
            });
        }

        // stdout is drained on its own task so a chatty tool never blocks on a full pipe
        let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let mut result = None;
        let mut error = None;
        while let Some(line) = rx.recv().await {
            match ToolEvent::parse(&line) {
                Some(ToolEvent::Progress { progress, partial }) => {
                    ctx.report_progress(&task.task_id, clamp_progress(progress), partial)
                        .await;
                }
                Some(ToolEvent::Result { data }) => result = Some(data),
                Some(ToolEvent::Error { message }) => {
                    warn!(task_id = %task.task_id, "Tool reported error: {}", message);
                    error = Some(message);
                }
                None => info!(task_id = %task.task_id, "{}", line),
            }
        }
        let _ = reader.await;

        let status = child.wait().await?;
        if !status.success() {
            bail!(error.unwrap_or_else(|| format!("{} exited with {}", self.command.program, status)));
        }
        if let Some(message) = error {
            bail!(message);
        }
        Ok(result.unwrap_or(Value::Null))
    }
}
