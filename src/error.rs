use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::schedule::types::TaskStatus;
use crate::watchdog::WorkerStatus;

/// Errors shared by the store, the wire protocol, the supervisor and the watchdog.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} would close a dependency cycle")]
    CyclicDependency(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store service unreachable at {addr}: {reason}")]
    ServiceUnreachable { addr: String, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("child process {name} exited: {status}")]
    ChildProcessDied { name: String, status: String },

    #[error("watchdog: status {status} without heartbeat for {age:?} (limit {limit:?})")]
    WatchdogTimeout {
        status: WorkerStatus,
        age: Duration,
        limit: Duration,
    },

    #[error("store service error: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Machine-readable error code carried next to the message in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DuplicateTask,
    TaskNotFound,
    InvalidTransition,
    CyclicDependency,
    StoreUnavailable,
    ProtocolError,
    Internal,
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::DuplicateTask(_) => ErrorCode::DuplicateTask,
            QueueError::TaskNotFound(_) => ErrorCode::TaskNotFound,
            QueueError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            QueueError::CyclicDependency(_) => ErrorCode::CyclicDependency,
            QueueError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            QueueError::Protocol(_) | QueueError::Json(_) => ErrorCode::ProtocolError,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuilds a typed error from an error response received over the wire.
    pub fn from_remote(code: Option<ErrorCode>, message: String) -> Self {
        match code {
            Some(ErrorCode::DuplicateTask) => QueueError::DuplicateTask(message),
            Some(ErrorCode::TaskNotFound) => QueueError::TaskNotFound(message),
            Some(ErrorCode::CyclicDependency) => QueueError::CyclicDependency(message),
            Some(ErrorCode::StoreUnavailable) => QueueError::StoreUnavailable(message),
            Some(ErrorCode::ProtocolError) => QueueError::Protocol(message),
            Some(ErrorCode::InvalidTransition) => {
                parse_transition(&message).unwrap_or(QueueError::Remote(message))
            }
            Some(ErrorCode::Internal) | None => QueueError::Remote(message),
        }
    }

    /// True for errors that mean the store service itself is gone.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            QueueError::ServiceUnreachable { .. } | QueueError::Timeout(_)
        )
    }
}

// Reads back the `InvalidTransition` display text: "task <id>: cannot move from <from> to <to>".
fn parse_transition(message: &str) -> Option<QueueError> {
    let (task_id, statuses) = message.strip_prefix("task ")?.rsplit_once(": cannot move from ")?;
    let (from, to) = statuses.split_once(" to ")?;
    Some(QueueError::InvalidTransition {
        task_id: task_id.to_string(),
        from: from.parse().ok()?,
        to: to.parse().ok()?,
    })
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        QueueError::StoreUnavailable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_codes_round_back_to_variants() {
        let err = QueueError::DuplicateTask("a".into());
        let rebuilt = QueueError::from_remote(Some(err.code()), err.to_string());
        assert!(matches!(rebuilt, QueueError::DuplicateTask(_)));

        let rebuilt = QueueError::from_remote(None, "boom".into());
        assert!(matches!(rebuilt, QueueError::Remote(_)));
    }

    #[test]
    fn test_remote_invalid_transition_is_typed() {
        let err = QueueError::InvalidTransition {
            task_id: "chain: a".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::Failed,
        };
        let rebuilt = QueueError::from_remote(Some(err.code()), err.to_string());
        assert!(matches!(
            rebuilt,
            QueueError::InvalidTransition { ref task_id, from: TaskStatus::Completed, to: TaskStatus::Failed }
                if task_id == "chain: a"
        ));

        let rebuilt = QueueError::from_remote(Some(ErrorCode::InvalidTransition), "nope".into());
        assert!(matches!(rebuilt, QueueError::Remote(m) if m == "nope"));
    }

    #[test]
    fn test_unreachable_classification() {
        let err = QueueError::ServiceUnreachable {
            addr: "127.0.0.1:1".into(),
            reason: "connection refused".into(),
        };
        assert!(err.is_unreachable());
        assert!(!QueueError::TaskNotFound("x".into()).is_unreachable());
    }
}
