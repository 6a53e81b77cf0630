pub mod log;
pub mod task;

pub use log::LogStorage;
pub use task::{InsertOutcome, SqliteTaskStorage, TaskStorage, UpdateOutcome};
