#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use taskq::config::ApiConfig;
use taskq::protocol::{RpcClient, RpcClientConfig};
use taskq::utils::{logger, shutdown_signal};
use taskq::LOG_DIR;

#[tokio::main]
async fn main() -> Result<()> {
    taskq::init_env();
    let _guard = logger::init(LOG_DIR.as_str(), "taskq-api")?;

    info!("Starting taskq API ({})", env!("GIT_HASH"));

    let config = ApiConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let client = Arc::new(RpcClient::new(config.store_addr, RpcClientConfig::from_env()?));
    info!(store_addr = %config.store_addr, "Using store service");

    // 启动 HTTP 服务器
    match taskq::web::start_server(client, config.bind_addr, shutdown_signal()).await {
        Ok(()) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
