use async_trait::async_trait;

use crate::error::Result;
use crate::schedule::types::{LogEntry, LogLevel, LogQuery};

pub const DEFAULT_LOG_QUERY_LIMIT: u32 = 200;

/// Append-only diagnostics shared by every process through the store service.
#[async_trait]
pub trait LogStorage: Send + Sync + 'static {
    async fn append(&self, source: &str, level: LogLevel, message: &str) -> Result<i64>;
    /// Newest first. Empty filter lists match nothing, absent ones match everything.
    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>>;
}
