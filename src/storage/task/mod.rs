use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::schedule::types::{ClaimedTask, NewTask, Task, TaskStatus};
pub mod sqlite;
pub mod entity;
pub mod mapping;

pub use sqlite::SqliteTaskStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    // no row with that task_id; nothing was written
    Missing,
    // the row exists but its current status does not allow the change
    Rejected { current: TaskStatus },
}

#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    async fn initialize(&self) -> Result<()>;
    async fn create(&self, task: &NewTask) -> Result<InsertOutcome>;
    async fn get(&self, task_id: &str) -> Result<Option<Task>>;
    async fn list(&self) -> Result<Vec<Task>>;
    async fn claim_next(&self) -> Result<Option<ClaimedTask>>;
    async fn update_status(&self, task_id: &str, status: TaskStatus, result: Option<&Value>) -> Result<UpdateOutcome>;
    async fn update_progress(&self, task_id: &str, progress: u8, partial: Option<&Value>) -> Result<UpdateOutcome>;
    async fn find_dependent(&self, parent_task_id: &str) -> Result<Option<String>>;
    /// Every task whose `depends_on` is `parent_task_id`, oldest first.
    async fn list_dependents(&self, parent_task_id: &str) -> Result<Vec<Task>>;
    async fn count_by_status(&self, statuses: &[TaskStatus]) -> Result<u64>;

    async fn any_active(&self) -> Result<bool> {
        Ok(self.count_by_status(&TaskStatus::ACTIVE).await? > 0)
    }
}

#[cfg(test)]
mod tests;
