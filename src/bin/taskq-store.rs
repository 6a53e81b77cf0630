#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use taskq::config::StoreServiceConfig;
use taskq::protocol::{ReadySignal, StoreService};
use taskq::storage::SqliteTaskStorage;
use taskq::utils::{logger, shutdown_signal};
use taskq::LOG_DIR;

#[tokio::main]
async fn main() -> Result<()> {
    taskq::init_env();
    let _guard = logger::init(LOG_DIR.as_str(), "taskq-store")?;

    info!("Starting taskq store service ({})", env!("GIT_HASH"));

    let config = StoreServiceConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    // 初始化 storage
    info!("Opening task database {}", config.database_path.display());
    let storage = Arc::new(SqliteTaskStorage::new(&config.database_path, config.pool_size).await?);

    let listener = TcpListener::bind(config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, pool_size = config.pool_size, "Store service listening");

    ReadySignal::new(local_addr.port())
        .announce(config.ready_file.as_deref())
        .await?;

    StoreService::new(storage.clone())
        .serve(listener, shutdown_signal())
        .await?;

    storage.close().await;
    info!("Store service stopped");
    Ok(())
}
