use axum::Router;
use std::sync::Arc;
use crate::protocol::client::RpcClient;

pub mod tasks;

pub fn router(client: Arc<RpcClient>) -> Router {
    Router::new().merge(tasks::tasks_router(client))
}
