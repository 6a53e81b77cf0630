use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::entity::Model as TaskModel;
use super::{InsertOutcome, TaskStorage, UpdateOutcome};
use crate::error::{QueueError, Result};
use crate::schedule::types::{
    ClaimedTask, LogEntry, LogLevel, LogQuery, NewTask, Task, TaskStatus, TaskType,
};
use crate::storage::log::{LogStorage, DEFAULT_LOG_QUERY_LIMIT};

// a dependency walk longer than this is treated as acyclic and logged
const MAX_CHAIN_HOPS: usize = 1024;

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL UNIQUE,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        progress INTEGER NOT NULL DEFAULT 0,
        payload TEXT NOT NULL,
        result TEXT,
        depends_on TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, seq)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_depends_on ON tasks(depends_on)",
    r#"
    CREATE TABLE IF NOT EXISTS system_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        source TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_system_logs_level ON system_logs(level)",
    "CREATE INDEX IF NOT EXISTS idx_system_logs_source ON system_logs(source)",
];

// Finds the oldest eligible pending task and marks it processing in one statement.
// Dependency-free tasks sort before dependent ones, then insertion order.
const CLAIM_SQL: &str = r#"
    UPDATE tasks
    SET status = 'processing', updated_at = ?
    WHERE seq = (
        SELECT t.seq FROM tasks t
        LEFT JOIN tasks parent ON parent.task_id = t.depends_on
        WHERE t.status = 'pending'
          AND (t.depends_on IS NULL OR parent.status = 'completed')
        ORDER BY (t.depends_on IS NOT NULL), t.seq
        LIMIT 1
    )
    AND status = 'pending'
    RETURNING task_id, task_type, payload
"#;

/// Bounded retry for transient file-level failures (locked database, pool exhaustion, I/O).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(25),
        }
    }
}

pub struct SqliteTaskStorage {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl SqliteTaskStorage {
    /// Opens (creating if needed) the database file with a pool of `pool_size` connections.
    pub async fn new(database_path: impl AsRef<Path>, pool_size: u32) -> Result<Self> {
        let database_path = database_path.as_ref();
        info!("Initializing SQLite task storage at {}", database_path.display());

        if let Some(dir) = database_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let storage = Self {
            pool,
            retry: RetryPolicy::default(),
        };
        storage.initialize().await?;
        Ok(storage)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
        T: Send,
    {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retry.max_attempts => {
                    warn!(op, attempt, error = %e, "Transient store failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(QueueError::StoreUnavailable(format!("{}: {}", op, e))),
            }
        }
    }

    async fn current_status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let pool = &self.pool;
        let status: Option<String> = self
            .with_retry("current_status", || async move {
                sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

        status
            .map(|s| s.parse().map_err(QueueError::StoreUnavailable))
            .transpose()
    }

    async fn parent_of(&self, task_id: &str) -> Result<Option<String>> {
        let pool = &self.pool;
        let parent: Option<Option<String>> = self
            .with_retry("parent_of", || async move {
                sqlx::query_scalar("SELECT depends_on FROM tasks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
        Ok(parent.flatten())
    }

    /// True when following `depends_on` links from `parent` leads back to `task_id`.
    async fn closes_cycle(&self, task_id: &str, parent: &str) -> Result<bool> {
        let mut current = Some(parent.to_string());
        let mut hops = 0;
        while let Some(id) = current {
            if id == task_id {
                return Ok(true);
            }
            if hops == MAX_CHAIN_HOPS {
                warn!(task_id, "Dependency chain exceeds {} hops, not walking further", MAX_CHAIN_HOPS);
                return Ok(false);
            }
            hops += 1;
            current = self.parent_of(&id).await?;
        }
        Ok(false)
    }

    fn row_to_model(row: &SqliteRow) -> Result<TaskModel> {
        Ok(TaskModel {
            seq: row.try_get("seq")?,
            task_id: row.try_get("task_id")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            depends_on: row.try_get("depends_on")?,
            created_at: parse_timestamp(row.try_get("created_at")?)?,
            updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        })
    }

    fn row_to_task(row: &SqliteRow) -> Result<Task> {
        Task::try_from(Self::row_to_model(row)?)
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::StoreUnavailable(format!("bad timestamp {:?}: {}", raw, e)))
}

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn optional_json(value: Option<&Value>) -> Result<Option<String>> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            let pool = &self.pool;
            self.with_retry("initialize", || async move {
                sqlx::query(statement).execute(pool).await
            })
            .await?;
        }
        debug!("Task store schema ready");
        Ok(())
    }

    async fn create(&self, task: &NewTask) -> Result<InsertOutcome> {
        if let Some(parent) = task.depends_on.as_deref() {
            if self.current_status(&task.task_id).await?.is_some() {
                debug!(task_id = %task.task_id, "Duplicate task insert ignored");
                return Ok(InsertOutcome::Duplicate);
            }
            if self.closes_cycle(&task.task_id, parent).await? {
                return Err(QueueError::CyclicDependency(task.task_id.clone()));
            }
        }

        let payload = serde_json::to_string(&task.payload)?;
        let now = now_text();
        let pool = &self.pool;
        let (payload, now) = (payload.as_str(), now.as_str());

        let done = self
            .with_retry("create", || async move {
                sqlx::query(
                    r#"
                    INSERT INTO tasks
                    (task_id, task_type, status, progress, payload, depends_on, created_at, updated_at)
                    VALUES (?, ?, 'pending', 0, ?, ?, ?, ?)
                    ON CONFLICT(task_id) DO NOTHING
                    "#,
                )
                .bind(&task.task_id)
                .bind(task.task_type.as_str())
                .bind(payload)
                .bind(task.depends_on.as_deref())
                .bind(now)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

        if done.rows_affected() == 0 {
            debug!(task_id = %task.task_id, "Duplicate task insert ignored");
            return Ok(InsertOutcome::Duplicate);
        }
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let pool = &self.pool;
        let row = self
            .with_retry("get", || async move {
                sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let pool = &self.pool;
        let rows = self
            .with_retry("list", || async move {
                sqlx::query("SELECT * FROM tasks ORDER BY seq DESC")
                    .fetch_all(pool)
                    .await
            })
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn claim_next(&self) -> Result<Option<ClaimedTask>> {
        let now = now_text();
        let (pool, now) = (&self.pool, now.as_str());
        let row = self
            .with_retry("claim", || async move {
                sqlx::query(CLAIM_SQL).bind(now).fetch_optional(pool).await
            })
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let task_type: String = row.try_get("task_type")?;
        let payload: String = row.try_get("payload")?;
        Ok(Some(ClaimedTask {
            task_id: row.try_get("task_id")?,
            task_type: TaskType::from(task_type),
            payload: serde_json::from_str(&payload)?,
        }))
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&Value>,
    ) -> Result<UpdateOutcome> {
        let Some(current) = self.current_status(task_id).await? else {
            return Ok(UpdateOutcome::Missing);
        };
        // processing is only ever entered through claim_next
        if status == TaskStatus::Processing || !current.can_transition_to(status) {
            return Ok(UpdateOutcome::Rejected { current });
        }

        let result = optional_json(result)?;
        let now = now_text();
        let pool = &self.pool;
        let (result, now) = (result.as_deref(), now.as_str());

        let done = self
            .with_retry("update_status", || async move {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = ?,
                        result = COALESCE(?, result),
                        progress = CASE WHEN ? = 'completed' THEN 100 ELSE progress END,
                        updated_at = ?
                    WHERE task_id = ? AND status = ?
                    "#,
                )
                .bind(status.as_str())
                .bind(result)
                .bind(status.as_str())
                .bind(now)
                .bind(task_id)
                .bind(current.as_str())
                .execute(pool)
                .await
            })
            .await?;

        if done.rows_affected() == 0 {
            return Ok(UpdateOutcome::Rejected { current });
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        partial: Option<&Value>,
    ) -> Result<UpdateOutcome> {
        let Some(current) = self.current_status(task_id).await? else {
            return Ok(UpdateOutcome::Missing);
        };
        if current != TaskStatus::Processing {
            return Ok(UpdateOutcome::Rejected { current });
        }

        let partial = optional_json(partial)?;
        let now = now_text();
        let progress = i64::from(progress.min(100));
        let pool = &self.pool;
        let (partial, now) = (partial.as_deref(), now.as_str());

        let done = self
            .with_retry("update_progress", || async move {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET progress = ?, result = COALESCE(?, result), updated_at = ?
                    WHERE task_id = ? AND status = 'processing'
                    "#,
                )
                .bind(progress)
                .bind(partial)
                .bind(now)
                .bind(task_id)
                .execute(pool)
                .await
            })
            .await?;

        if done.rows_affected() == 0 {
            return Ok(UpdateOutcome::Rejected { current });
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn find_dependent(&self, parent_task_id: &str) -> Result<Option<String>> {
        let pool = &self.pool;
        self.with_retry("find_dependent", || async move {
            sqlx::query_scalar("SELECT task_id FROM tasks WHERE depends_on = ? ORDER BY seq LIMIT 1")
                .bind(parent_task_id)
                .fetch_optional(pool)
                .await
        })
        .await
    }

    async fn list_dependents(&self, parent_task_id: &str) -> Result<Vec<Task>> {
        let pool = &self.pool;
        let rows = self
            .with_retry("list_dependents", || async move {
                sqlx::query("SELECT * FROM tasks WHERE depends_on = ? ORDER BY seq")
                    .bind(parent_task_id)
                    .fetch_all(pool)
                    .await
            })
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_by_status(&self, statuses: &[TaskStatus]) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; statuses.len()].join(",");
        let sql = format!("SELECT COUNT(*) FROM tasks WHERE status IN ({})", placeholders);
        let (pool, sql) = (&self.pool, sql.as_str());

        let count: i64 = self
            .with_retry("count_by_status", || async move {
                let mut query = sqlx::query_scalar(sql);
                for status in statuses {
                    query = query.bind(status.as_str());
                }
                query.fetch_one(pool).await
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl LogStorage for SqliteTaskStorage {
    async fn append(&self, source: &str, level: LogLevel, message: &str) -> Result<i64> {
        let now = now_text();
        let (pool, now) = (&self.pool, now.as_str());
        let done = self
            .with_retry("append_log", || async move {
                sqlx::query(
                    "INSERT INTO system_logs (timestamp, source, level, message) VALUES (?, ?, ?, ?)",
                )
                .bind(now)
                .bind(source)
                .bind(level.as_str())
                .bind(message)
                .execute(pool)
                .await
            })
            .await?;
        Ok(done.last_insert_rowid())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let levels: Option<Vec<&'static str>> = query
            .levels
            .as_ref()
            .map(|levels| levels.iter().map(LogLevel::as_str).collect());
        let sources = query.sources.as_deref();

        if levels.as_ref().is_some_and(Vec::is_empty) || sources.is_some_and(<[String]>::is_empty) {
            return Ok(Vec::new());
        }

        let mut sql = String::from("SELECT id, timestamp, source, level, message FROM system_logs");
        let mut clauses = Vec::new();
        if let Some(levels) = &levels {
            clauses.push(format!("level IN ({})", vec!["?"; levels.len()].join(",")));
        }
        if let Some(sources) = sources {
            clauses.push(format!("source IN ({})", vec!["?"; sources.len()].join(",")));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let limit = i64::from(query.limit.unwrap_or(DEFAULT_LOG_QUERY_LIMIT));
        let (pool, sql, levels) = (&self.pool, sql.as_str(), levels.as_deref());

        let rows = self
            .with_retry("query_logs", || async move {
                let mut q = sqlx::query(sql);
                for level in levels.unwrap_or_default() {
                    q = q.bind(*level);
                }
                for source in sources.unwrap_or_default() {
                    q = q.bind(source.as_str());
                }
                q.bind(limit).fetch_all(pool).await
            })
            .await?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level")?;
                Ok(LogEntry {
                    id: row.try_get("id")?,
                    timestamp: parse_timestamp(row.try_get("timestamp")?)?,
                    source: row.try_get("source")?,
                    level: level.parse().map_err(QueueError::StoreUnavailable)?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }
}
