use crate::error::{QueueError, Result};
use crate::storage::task::entity::Model as TaskModel;
use crate::schedule::types::{Task, TaskType};

impl TryFrom<TaskModel> for Task {
    type Error = QueueError;

    fn try_from(model: TaskModel) -> Result<Self> {
        Ok(Task {
            task_id: model.task_id,
            task_type: TaskType::from(model.task_type),
            status: model.status.parse().map_err(QueueError::StoreUnavailable)?,
            progress: model.progress.clamp(0, 100) as u8,
            payload: serde_json::from_str(&model.payload)?,
            result: model.result.map(|r| serde_json::from_str(&r)).transpose()?,
            depends_on: model.depends_on,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn model(status: &str) -> TaskModel {
        TaskModel {
            task_id: "t1".into(),
            seq: 1,
            task_type: "download".into(),
            status: status.into(),
            progress: 140,
            payload: r#"{"url":"https://example.com/a.mp3"}"#.into(),
            result: None,
            depends_on: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_model_to_task() {
        let task = Task::try_from(model("processing")).unwrap();
        assert_eq!(task.task_type, TaskType::Download);
        assert_eq!(task.progress, 100);
        assert_eq!(task.payload["url"], "https://example.com/a.mp3");
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        assert!(Task::try_from(model("retrying")).is_err());
    }
}
