#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use taskq::config::WorkerConfig;
use taskq::protocol::{RpcClient, RpcClientConfig};
use taskq::schedule::{CommandProcessor, TaskWorker};
use taskq::utils::{logger, shutdown_signal};
use taskq::watchdog::{Heartbeat, ProcessTreeTerminator, Watchdog};
use taskq::LOG_DIR;

#[tokio::main]
async fn main() -> Result<()> {
    taskq::init_env();
    let _guard = logger::init(LOG_DIR.as_str(), "taskq-worker")?;

    info!("Starting taskq worker ({})", env!("GIT_HASH"));

    let config = WorkerConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    if config.tools.is_empty() {
        warn!("No TASKQ_TOOL_<TYPE> configured; every claimed task will fail");
    }

    // 看门狗从 starting 状态开始计时
    let heartbeat = Heartbeat::new();
    let watchdog = Watchdog::new(heartbeat.clone(), config.watchdog.clone(), ProcessTreeTerminator);
    let watchdog_shutdown = watchdog.shutdown_handle();
    tokio::spawn(async move { watchdog.run().await });

    let client = Arc::new(RpcClient::new(config.store_addr, RpcClientConfig::from_env()?));
    let mut worker = TaskWorker::new(client, heartbeat, config.work_dir.clone())
        .with_interval(config.poll_interval);
    for (task_type, command) in &config.tools {
        worker.register_processor(Arc::new(CommandProcessor::new(task_type.clone(), command.clone())));
    }

    if let Some(command) = &config.install_command {
        worker.install(command).await?;
    }

    info!(work_dir = %config.work_dir.display(), "Worker ready");
    // 收到退出信号后先结束当前任务
    worker.run(shutdown_signal()).await;
    info!("Worker shutting down");

    watchdog_shutdown.notify_one();
    Ok(())
}
