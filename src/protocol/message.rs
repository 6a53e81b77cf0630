use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ErrorCode, QueueError, Result};
use crate::schedule::types::{LogLevel, TaskStatus, TaskType};

/// Every operation the store service understands, as sent on the wire:
/// `{"action": "<name>", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Request {
    InitializeStore {},
    AddTask {
        task_id: String,
        #[serde(rename = "type")]
        task_type: TaskType,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        depends_on: Option<String>,
    },
    ClaimTask {},
    UpdateTaskProgress {
        task_id: String,
        progress: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_result: Option<Value>,
    },
    UpdateTaskStatus {
        task_id: String,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    GetTask {
        task_id: String,
    },
    FindDependentTask {
        parent_task_id: String,
    },
    ListDependentTasks {
        parent_task_id: String,
    },
    ListTasks {},
    AnyActiveTasks {},
    AppendLog {
        source: String,
        level: LogLevel,
        message: String,
    },
    QueryLogs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        levels: Option<Vec<LogLevel>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sources: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

/// Action names alone; used to tell an unknown action apart from bad params.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    InitializeStore,
    AddTask,
    ClaimTask,
    UpdateTaskProgress,
    UpdateTaskStatus,
    GetTask,
    FindDependentTask,
    ListDependentTasks,
    ListTasks,
    AnyActiveTasks,
    AppendLog,
    QueryLogs,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::InitializeStore => "initialize_store",
            Action::AddTask => "add_task",
            Action::ClaimTask => "claim_task",
            Action::UpdateTaskProgress => "update_task_progress",
            Action::UpdateTaskStatus => "update_task_status",
            Action::GetTask => "get_task",
            Action::FindDependentTask => "find_dependent_task",
            Action::ListDependentTasks => "list_dependent_tasks",
            Action::ListTasks => "list_tasks",
            Action::AnyActiveTasks => "any_active_tasks",
            Action::AppendLog => "append_log",
            Action::QueryLogs => "query_logs",
        }
    }
}

impl Request {
    pub fn action(&self) -> Action {
        match self {
            Request::InitializeStore {} => Action::InitializeStore,
            Request::AddTask { .. } => Action::AddTask,
            Request::ClaimTask {} => Action::ClaimTask,
            Request::UpdateTaskProgress { .. } => Action::UpdateTaskProgress,
            Request::UpdateTaskStatus { .. } => Action::UpdateTaskStatus,
            Request::GetTask { .. } => Action::GetTask,
            Request::FindDependentTask { .. } => Action::FindDependentTask,
            Request::ListDependentTasks { .. } => Action::ListDependentTasks,
            Request::ListTasks {} => Action::ListTasks,
            Request::AnyActiveTasks {} => Action::AnyActiveTasks,
            Request::AppendLog { .. } => Action::AppendLog,
            Request::QueryLogs { .. } => Action::QueryLogs,
        }
    }

    /// Decodes a frame body. `params` may be omitted or null for parameterless actions.
    pub fn parse(body: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            action: String,
            #[serde(default)]
            params: Option<Value>,
        }

        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| QueueError::Protocol(format!("malformed request: {}", e)))?;

        let action: Action = serde_json::from_value(Value::String(envelope.action.clone()))
            .map_err(|_| QueueError::Protocol(format!("unknown action: {}", envelope.action)))?;

        let params = envelope.params.unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(json!({ "action": envelope.action, "params": params })).map_err(|e| {
            QueueError::Protocol(format!("invalid params for {}: {}", action.as_str(), e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl Response {
    pub fn success(data: impl Serialize) -> Result<Self> {
        Ok(Response::Success {
            data: serde_json::to_value(data)?,
        })
    }

    pub fn error(error: &QueueError) -> Self {
        Response::Error {
            message: error.to_string(),
            code: Some(error.code()),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Response::Success { data } => Ok(data),
            Response::Error { message, code } => Err(QueueError::from_remote(code, message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTaskData {
    pub task_id: String,
}
