use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;


/// Tag naming the external tool that handles a task.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Download,
    Transcribe,
    MediaFetch,
    AiProcess,
    // caller-defined tags pass through untouched
    Custom(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Download => "download",
            TaskType::Transcribe => "transcribe",
            TaskType::MediaFetch => "media_fetch",
            TaskType::AiProcess => "ai_process",
            TaskType::Custom(tag) => tag,
        }
    }
}

impl From<&str> for TaskType {
    fn from(tag: &str) -> Self {
        match tag {
            "download" => TaskType::Download,
            "transcribe" => TaskType::Transcribe,
            "media_fetch" => TaskType::MediaFetch,
            "ai_process" => TaskType::AiProcess,
            other => TaskType::Custom(other.to_string()),
        }
    }
}

impl From<String> for TaskType {
    fn from(tag: String) -> Self {
        TaskType::from(tag.as_str())
    }
}

impl From<TaskType> for String {
    fn from(task_type: TaskType) -> Self {
        task_type.as_str().to_string()
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Forward-only lifecycle. `Processing` is reachable only from `Pending`,
    /// and terminal states accept nothing.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        match status {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {}", status)),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub payload: Value,
    pub result: Option<Value>,
    pub depends_on: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a producer hands to `add_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Value,
    #[serde(default)]
    pub depends_on: Option<String>,
}

impl NewTask {
    pub fn new(task_id: impl Into<String>, task_type: TaskType, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            payload,
            depends_on: None,
        }
    }

    pub fn depends_on(mut self, parent: impl Into<String>) -> Self {
        self.depends_on = Some(parent.into());
        self
    }
}

/// What `claim_task` hands back to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(level: &str) -> Result<Self, Self::Err> {
        match level.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", level)),
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub levels: Option<Vec<LogLevel>>,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_forward_only() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn test_task_type_tags() {
        assert_eq!(TaskType::from("media_fetch"), TaskType::MediaFetch);
        assert_eq!(TaskType::from("process"), TaskType::Custom("process".into()));
        assert_eq!(TaskType::Custom("process".into()).to_string(), "process");

        let json = serde_json::to_string(&TaskType::AiProcess).unwrap();
        assert_eq!(json, "\"ai_process\"");
    }

    #[test]
    fn test_new_task_wire_shape() {
        let task = NewTask::new("b", TaskType::from("process"), serde_json::json!({"k": 1}))
            .depends_on("a");
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "process");
        assert_eq!(value["depends_on"], "a");
    }
}
