pub mod types;
pub mod processors;
pub mod scheduler;

// 重导出主要类型
pub use types::{ClaimedTask, LogEntry, LogLevel, LogQuery, NewTask, Task, TaskStatus, TaskType};

// 重导出处理器接口
pub use processors::{CommandProcessor, TaskContext, TaskProcessor};

pub use scheduler::TaskWorker;
