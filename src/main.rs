#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use tracing::{error, info};

use taskq::config::SupervisorConfig;
use taskq::protocol::RpcClientConfig;
use taskq::supervisor::Supervisor;
use taskq::utils::{logger, shutdown_signal};
use taskq::LOG_DIR;

#[tokio::main]
async fn main() -> Result<()> {
    taskq::init_env();
    // 初始化日志系统
    let _guard = logger::init(LOG_DIR.as_str(), "taskq")?;

    info!("Starting taskq supervisor ({})", env!("GIT_HASH"));

    let config = SupervisorConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let rpc = RpcClientConfig::from_env()?;
    info!(
        store = %config.store_program,
        dependents = ?config.dependents,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Configuration loaded"
    );

    // 启动并监控所有子进程
    match Supervisor::new(config, rpc).run(shutdown_signal()).await {
        Ok(()) => {
            info!("Supervisor stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Supervisor stopped: {}", e);
            Err(e.into())
        }
    }
}
