use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::frame::{read_json, write_json};
use super::message::{AddTaskData, Request, Response};
use crate::error::{QueueError, Result};
use crate::schedule::types::{ClaimedTask, LogEntry, LogLevel, LogQuery, NewTask, Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the store service. Holds one connection, opened on first use and
/// reused while it stays healthy; one call is in flight at a time.
///
/// Calls are never retried here: a claim that timed out may still have been applied.
pub struct RpcClient {
    addr: SocketAddr,
    config: RpcClientConfig,
    connection: Mutex<Option<TcpStream>>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr, config: RpcClientConfig) -> Self {
        Self {
            addr,
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn unreachable(&self, reason: impl ToString) -> QueueError {
        QueueError::ServiceUnreachable {
            addr: self.addr.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| self.unreachable(format!("connect timed out after {:?}", self.config.connect_timeout)))?
            .map_err(|e| self.unreachable(e))?;
        stream.set_nodelay(true).map_err(|e| self.unreachable(e))?;
        debug!(addr = %self.addr, "Connected to store service");
        Ok(stream)
    }

    /// Sends one request and returns the `data` of a success response.
    pub async fn call(&self, request: &Request) -> Result<Value> {
        let mut cached = self.connection.lock().await;
        let mut stream = match cached.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let exchange = async {
            write_json(&mut stream, request).await?;
            read_json::<_, Response>(&mut stream).await
        };
        let response = match tokio::time::timeout(self.config.request_timeout, exchange).await {
            Ok(Ok(response)) => response,
            // the stream is dropped with the error; the next call reconnects
            Ok(Err(QueueError::Io(e))) => return Err(self.unreachable(e)),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(QueueError::Timeout(format!(
                    "{} after {:?}",
                    request.action().as_str(),
                    self.config.request_timeout
                )))
            }
        };

        *cached = Some(stream);
        response.into_result()
    }

    async fn call_as<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let action = request.action();
        let data = self.call(&request).await?;
        serde_json::from_value(data)
            .map_err(|e| QueueError::Protocol(format!("unexpected {} response: {}", action.as_str(), e)))
    }

    pub async fn initialize_store(&self) -> Result<()> {
        self.call(&Request::InitializeStore {}).await.map(|_| ())
    }

    /// Returns the id the store recorded.
    pub async fn add_task(&self, task: &NewTask) -> Result<String> {
        let data: AddTaskData = self
            .call_as(Request::AddTask {
                task_id: task.task_id.clone(),
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                depends_on: task.depends_on.clone(),
            })
            .await?;
        Ok(data.task_id)
    }

    pub async fn claim_task(&self) -> Result<Option<ClaimedTask>> {
        self.call_as(Request::ClaimTask {}).await
    }

    pub async fn update_task_progress(&self, task_id: &str, progress: u8, partial_result: Option<Value>) -> Result<()> {
        self.call(&Request::UpdateTaskProgress {
            task_id: task_id.to_string(),
            progress: u32::from(progress),
            partial_result,
        })
        .await
        .map(|_| ())
    }

    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus, result: Option<Value>) -> Result<()> {
        self.call(&Request::UpdateTaskStatus {
            task_id: task_id.to_string(),
            status,
            result,
        })
        .await
        .map(|_| ())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.call_as(Request::GetTask {
            task_id: task_id.to_string(),
        })
        .await
    }

    pub async fn find_dependent_task(&self, parent_task_id: &str) -> Result<Option<String>> {
        self.call_as(Request::FindDependentTask {
            parent_task_id: parent_task_id.to_string(),
        })
        .await
    }

    /// All direct dependents of `parent_task_id`, oldest first.
    pub async fn list_dependent_tasks(&self, parent_task_id: &str) -> Result<Vec<Task>> {
        self.call_as(Request::ListDependentTasks {
            parent_task_id: parent_task_id.to_string(),
        })
        .await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.call_as(Request::ListTasks {}).await
    }

    pub async fn any_active_tasks(&self) -> Result<bool> {
        self.call_as(Request::AnyActiveTasks {}).await
    }

    pub async fn append_log(&self, source: &str, level: LogLevel, message: &str) -> Result<()> {
        self.call(&Request::AppendLog {
            source: source.to_string(),
            level,
            message: message.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        self.call_as(Request::QueryLogs {
            levels: query.levels.clone(),
            sources: query.sources.clone(),
            limit: query.limit,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server::StoreService;
    use crate::schedule::types::TaskType;
    use crate::storage::SqliteTaskStorage;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start_service() -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteTaskStorage::new(dir.path().join("tasks.db"), 2).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            StoreService::new(Arc::new(storage))
                .serve(listener, std::future::pending())
                .await
                .unwrap();
        });
        (addr, dir)
    }

    #[tokio::test]
    async fn test_typed_calls() {
        let (addr, _dir) = start_service().await;
        let client = RpcClient::new(addr, RpcClientConfig::default());

        client.initialize_store().await.unwrap();
        let id = client
            .add_task(&NewTask::new("t1", TaskType::Download, json!({"url": "u"})))
            .await
            .unwrap();
        assert_eq!(id, "t1");
        assert!(client.any_active_tasks().await.unwrap());

        let claimed = client.claim_task().await.unwrap().unwrap();
        assert_eq!(claimed.task_id, "t1");
        assert!(client.claim_task().await.unwrap().is_none());

        client.update_task_progress("t1", 50, Some(json!({"bytes": 10}))).await.unwrap();
        client
            .update_task_status("t1", TaskStatus::Completed, Some(json!({"file": "a.wav"})))
            .await
            .unwrap();

        let task = client.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(client.get_task("nope").await.unwrap().is_none());
        assert!(client.find_dependent_task("t1").await.unwrap().is_none());
        assert!(client.list_dependent_tasks("t1").await.unwrap().is_empty());
        assert_eq!(client.list_tasks().await.unwrap().len(), 1);

        client.append_log("worker", LogLevel::Info, "done").await.unwrap();
        let logs = client.query_logs(&LogQuery::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].source, "worker");
    }

    #[tokio::test]
    async fn test_remote_errors_are_typed() {
        let (addr, _dir) = start_service().await;
        let client = RpcClient::new(addr, RpcClientConfig::default());
        let task = NewTask::new("dup", TaskType::Transcribe, json!({}));

        client.add_task(&task).await.unwrap();
        assert!(matches!(client.add_task(&task).await, Err(QueueError::DuplicateTask(_))));
        assert!(matches!(
            client.update_task_status("ghost", TaskStatus::Failed, None).await,
            Err(QueueError::TaskNotFound(_))
        ));
        // pending cannot complete without a claim
        assert!(matches!(
            client.update_task_status("dup", TaskStatus::Completed, None).await,
            Err(QueueError::InvalidTransition { from: TaskStatus::Pending, to: TaskStatus::Completed, .. })
        ));
        // the connection survives error responses
        assert!(client.any_active_tasks().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RpcClient::new(addr, RpcClientConfig::default());
        let error = client.any_active_tasks().await.unwrap_err();
        assert!(error.is_unreachable());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        // accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let config = RpcClientConfig {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(100),
        };
        let client = RpcClient::new(addr, config);
        assert!(matches!(client.claim_task().await, Err(QueueError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_at_most_one_claim_across_clients() {
        let (addr, _dir) = start_service().await;
        let producer = RpcClient::new(addr, RpcClientConfig::default());
        for i in 0..20 {
            producer
                .add_task(&NewTask::new(format!("t{}", i), TaskType::Download, json!({})))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(tokio::spawn(async move {
                let client = RpcClient::new(addr, RpcClientConfig::default());
                let mut claimed = Vec::new();
                while let Some(task) = client.claim_task().await.unwrap() {
                    claimed.push(task.task_id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
