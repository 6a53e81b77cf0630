use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::error::QueueError;
use crate::protocol::client::RpcClient;
use crate::schedule::types::{LogEntry, LogLevel, LogQuery, NewTask, Task, TaskType};

pub fn tasks_router(client: Arc<RpcClient>) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/dependent", get(get_dependent))
        .route("/tasks/:task_id/dependents", get(list_dependents))
        .route("/logs", get(query_logs))
        .route("/health", get(health))
        .with_state(client)
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn failure<T: Serialize>(context: &str, e: QueueError) -> Reply<T> {
    let status = match &e {
        QueueError::DuplicateTask(_) => StatusCode::CONFLICT,
        QueueError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::CyclicDependency(_) | QueueError::Protocol(_) => StatusCode::BAD_REQUEST,
        e if e.is_unreachable() => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("{}: {}", context, e);
    }
    (status, Json(ApiResponse::error(e.to_string())))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    depends_on: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatedTask {
    task_id: String,
}

// Create task endpoint
async fn create_task(
    State(client): State<Arc<RpcClient>>,
    Json(req): Json<CreateTaskRequest>,
) -> Reply<CreatedTask> {
    let task = NewTask {
        task_id: req.task_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        task_type: req.task_type,
        payload: req.payload,
        depends_on: req.depends_on,
    };
    match client.add_task(&task).await {
        Ok(task_id) => (StatusCode::CREATED, Json(ApiResponse::success(CreatedTask { task_id }))),
        Err(e) => failure("Failed to create task", e),
    }
}

async fn list_tasks(State(client): State<Arc<RpcClient>>) -> Reply<Vec<Task>> {
    match client.list_tasks().await {
        Ok(tasks) => (StatusCode::OK, Json(ApiResponse::success(tasks))),
        Err(e) => failure("Failed to list tasks", e),
    }
}

// Get task endpoint
async fn get_task(State(client): State<Arc<RpcClient>>, Path(task_id): Path<String>) -> Reply<Task> {
    match client.get_task(&task_id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(ApiResponse::success(task))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Task not found".to_string())),
        ),
        Err(e) => failure("Failed to get task", e),
    }
}

async fn get_dependent(
    State(client): State<Arc<RpcClient>>,
    Path(task_id): Path<String>,
) -> Reply<Option<String>> {
    match client.find_dependent_task(&task_id).await {
        Ok(dependent) => (StatusCode::OK, Json(ApiResponse::success(dependent))),
        Err(e) => failure("Failed to find dependent task", e),
    }
}

async fn list_dependents(
    State(client): State<Arc<RpcClient>>,
    Path(task_id): Path<String>,
) -> Reply<Vec<Task>> {
    match client.list_dependent_tasks(&task_id).await {
        Ok(tasks) => (StatusCode::OK, Json(ApiResponse::success(tasks))),
        Err(e) => failure("Failed to list dependent tasks", e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogsParams {
    // comma separated
    levels: Option<String>,
    sources: Option<String>,
    limit: Option<u32>,
}

impl LogsParams {
    fn into_query(self) -> Result<LogQuery, String> {
        let levels = match self.levels {
            Some(raw) => Some(
                split_csv(&raw)
                    .into_iter()
                    .map(|level| level.parse::<LogLevel>())
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        Ok(LogQuery {
            levels,
            sources: self.sources.map(|raw| split_csv(&raw)),
            limit: self.limit,
        })
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

async fn query_logs(
    State(client): State<Arc<RpcClient>>,
    Query(params): Query<LogsParams>,
) -> Reply<Vec<LogEntry>> {
    let query = match params.into_query() {
        Ok(query) => query,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e))),
    };
    match client.query_logs(&query).await {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::success(entries))),
        Err(e) => failure("Failed to query logs", e),
    }
}

#[derive(Debug, Serialize)]
struct Health {
    active: bool,
}

async fn health(State(client): State<Arc<RpcClient>>) -> Reply<Health> {
    match client.any_active_tasks().await {
        Ok(active) => (StatusCode::OK, Json(ApiResponse::success(Health { active }))),
        Err(e) => failure("Health check failed", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::RpcClientConfig;
    use crate::protocol::server::StoreService;
    use crate::storage::SqliteTaskStorage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn setup_client() -> (Arc<RpcClient>, tempfile::TempDir) {
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
        (Arc::new(RpcClient::new(addr, RpcClientConfig::default())), dir)
    }

    fn create_request(task_id: Option<&str>, depends_on: Option<&str>) -> CreateTaskRequest {
        CreateTaskRequest {
            task_id: task_id.map(str::to_string),
            task_type: TaskType::Download,
            payload: json!({"url": "https://example.com/a.mp3"}),
            depends_on: depends_on.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let (client, _dir) = setup_client().await;

        let (status, Json(body)) = create_task(State(client.clone()), Json(create_request(Some("a"), None))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.data.unwrap().task_id, "a");

        let (status, _) = create_task(State(client.clone()), Json(create_request(Some("a"), None))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, Json(body)) = get_task(State(client.clone()), Path("a".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap().task_id, "a");

        let (status, Json(body)) = get_task(State(client.clone()), Path("missing".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.success);

        let (status, Json(body)) = health(State(client)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.data.unwrap().active);
    }

    #[tokio::test]
    async fn test_generated_id_and_dependent_lookup() {
        let (client, _dir) = setup_client().await;

        let (_, Json(body)) = create_task(State(client.clone()), Json(create_request(None, None))).await;
        let parent = body.data.unwrap().task_id;
        assert!(Uuid::parse_str(&parent).is_ok());

        create_task(State(client.clone()), Json(create_request(Some("child"), Some(&parent)))).await;
        create_task(State(client.clone()), Json(create_request(Some("sibling"), Some(&parent)))).await;
        let (status, Json(body)) = get_dependent(State(client.clone()), Path(parent.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap(), Some("child".to_string()));

        let (_, Json(body)) = list_dependents(State(client.clone()), Path(parent)).await;
        let ids: Vec<String> = body.data.unwrap().into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec!["child", "sibling"]);

        let (_, Json(body)) = list_tasks(State(client)).await;
        assert_eq!(body.data.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_is_bad_request() {
        let (client, _dir) = setup_client().await;
        let (status, _) = create_task(State(client), Json(create_request(Some("loop"), Some("loop")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logs_params() {
        let (client, _dir) = setup_client().await;
        client.append_log("worker", LogLevel::Error, "boom").await.unwrap();
        client.append_log("api", LogLevel::Info, "hello").await.unwrap();

        let params = LogsParams {
            levels: Some("error, warning".to_string()),
            ..LogsParams::default()
        };
        let (status, Json(body)) = query_logs(State(client.clone()), Query(params)).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.data.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "boom");

        let params = LogsParams {
            levels: Some("loud".to_string()),
            ..LogsParams::default()
        };
        let (status, _) = query_logs(State(client), Query(params)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_store_down_is_service_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = RpcClientConfig {
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(200),
        };
        let client = Arc::new(RpcClient::new(addr, config));

        let (status, Json(body)) = health(State(client)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.error.is_some());
    }
}
