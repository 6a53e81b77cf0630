//! Launches the store service and its dependents, watches them, and tears
//! everything down in reverse start order.
//!
//! Any child exit, a store that never becomes ready or a run of failed
//! failed liveness checks is fatal: the cause is logged and all children are stopped.

pub mod process;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{SupervisorConfig, STORE_ADDR_VAR};
use crate::error::{QueueError, Result};
use crate::protocol::client::{RpcClient, RpcClientConfig};
use process::{resolve_program, ManagedChild};

pub const HEARTBEAT_RUNNING: &str = "HEARTBEAT RUNNING";
pub const HEARTBEAT_IDLE: &str = "HEARTBEAT IDLE";

pub fn heartbeat_line(active: bool) -> &'static str {
    if active {
        HEARTBEAT_RUNNING
    } else {
        HEARTBEAT_IDLE
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    rpc: RpcClientConfig,
    children: Vec<ManagedChild>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, rpc: RpcClientConfig) -> Self {
        Self {
            config,
            rpc,
            children: Vec::new(),
        }
    }

    /// Runs until `shutdown` resolves (`Ok`) or a fatal condition occurs (`Err`).
    /// Children are stopped either way before this returns.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let outcome = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                Ok(())
            }
            result = self.launch_and_watch() => result,
        };

        match &outcome {
            Ok(()) => info!("Stopping children"),
            Err(e) => error!("Fatal: {}; stopping children", e),
        }
        self.stop_all().await;
        outcome
    }

    async fn launch_and_watch(&mut self) -> Result<()> {
        let store_addr = self.launch_store().await?;
        self.launch_dependents(store_addr)?;
        self.watch(store_addr).await
    }

    async fn launch_store(&mut self) -> Result<SocketAddr> {
        let program = resolve_program(&self.config.store_program);
        info!("Launching store service {}", program.display());

        let mut store = ManagedChild::spawn("taskq-store", &program, &[], &[])?;
        let ready = store.wait_for_ready(self.config.ready_timeout).await;
        self.children.push(store);
        let ready = ready?;

        let addr = SocketAddr::from(([127, 0, 0, 1], ready.port));
        info!(%addr, "Store service ready");
        Ok(addr)
    }

    fn launch_dependents(&mut self, store_addr: SocketAddr) -> Result<()> {
        let envs = [(STORE_ADDR_VAR, store_addr.to_string())];
        for name in self.config.dependents.clone() {
            let program = resolve_program(&name);
            let mut child = ManagedChild::spawn(&name, &program, &[], &envs)?;
            child.forward_stdout();
            self.children.push(child);
        }
        Ok(())
    }

    // Steady state: poll children while the liveness check runs on its own task,
    // so a slow store never delays noticing a dead child.
    async fn watch(&mut self, store_addr: SocketAddr) -> Result<()> {
        let mut liveness = AbortOnDrop(tokio::spawn(check_liveness(
            RpcClient::new(store_addr, self.rpc.clone()),
            self.config.heartbeat_interval,
            self.config.max_heartbeat_failures,
        )));
        let mut poll = tokio::time::interval(self.config.child_poll_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => self.check_children()?,
                joined = &mut liveness.0 => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err(QueueError::Io(std::io::Error::other(e))),
                    };
                }
            }
        }
    }

    fn check_children(&mut self) -> Result<()> {
        for child in &mut self.children {
            if let Some(status) = child.try_exited()? {
                return Err(QueueError::ChildProcessDied {
                    name: child.name().to_string(),
                    status: status.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn stop_all(&mut self) {
        let grace = self.config.grace_period;
        for child in self.children.iter_mut().rev() {
            child.terminate(grace).await;
        }
        self.children.clear();
    }
}

struct AbortOnDrop(JoinHandle<Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Prints a heartbeat line per successful check; returns once `max_failures`
/// checks in a row have failed.
async fn check_liveness(client: RpcClient, every: Duration, max_failures: u32) -> Result<()> {
    let mut heartbeat = tokio::time::interval(every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        heartbeat.tick().await;
        match client.any_active_tasks().await {
            Ok(active) => {
                failures = 0;
                emit(heartbeat_line(active)).await;
            }
            Err(e) => {
                failures += 1;
                warn!(failures, "Liveness check failed: {}", e);
                if failures >= max_failures {
                    return Err(e);
                }
            }
        }
    }
}

async fn emit(line: &str) {
    let mut stdout = tokio::io::stdout();
    let written = stdout.write_all(format!("{}\n", line).as_bytes()).await;
    if let Err(e) = written.and(stdout.flush().await) {
        warn!("Failed to write heartbeat: {}", e);
    }
}
