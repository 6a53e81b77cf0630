//! Per-process configuration loaded from the environment.
//!
//! Every value is looked up in the process environment first, then in `.env`
//! (through `dotenv`), then falls back to a default.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::client::RpcClientConfig;
use crate::schedule::types::TaskType;
use crate::watchdog::WatchdogConfig;
use crate::{DATABASE_PATH, DATA_DIR};

pub const STORE_ADDR_VAR: &str = "TASKQ_STORE_ADDR";
const TOOL_VAR_PREFIX: &str = "TASKQ_TOOL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(String, &'static str),
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .or_else(|| dotenv::var(name).ok())
        .filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T, hint: &'static str) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name.to_string(), hint)),
        None => Ok(default),
    }
}

fn secs_var(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default_secs, "must be a whole number of seconds").map(Duration::from_secs)
}

fn millis_var(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default_ms, "must be a whole number of milliseconds").map(Duration::from_millis)
}

/// Address of the store service, required by every process except the store itself.
pub fn store_addr() -> Result<SocketAddr, ConfigError> {
    let raw = var(STORE_ADDR_VAR).ok_or(ConfigError::Missing(STORE_ADDR_VAR))?;
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(STORE_ADDR_VAR.to_string(), "must be host:port"))
}

impl RpcClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            connect_timeout: millis_var(
                "TASKQ_RPC_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )?,
            request_timeout: millis_var(
                "TASKQ_RPC_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoreServiceConfig {
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub pool_size: u32,
    pub ready_file: Option<PathBuf>,
}

impl StoreServiceConfig {
    /// Optional:
    /// - `TASKQ_DATABASE_PATH` (default: `<data dir>/database/tasks.db`)
    /// - `TASKQ_STORE_ADDR` (default: `127.0.0.1:0`, an ephemeral port)
    /// - `TASKQ_STORE_POOL_SIZE` (default: 4)
    /// - `TASKQ_READY_FILE`
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = parse_var(
            STORE_ADDR_VAR,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            "must be host:port",
        )?;
        let pool_size: u32 = parse_var("TASKQ_STORE_POOL_SIZE", 4, "must be a positive integer")?;
        if pool_size == 0 {
            return Err(ConfigError::Invalid(
                "TASKQ_STORE_POOL_SIZE".to_string(),
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_path: var("TASKQ_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DATABASE_PATH.as_str())),
            bind_addr,
            pool_size,
            ready_file: var("TASKQ_READY_FILE").map(PathBuf::from),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub store_program: String,
    pub dependents: Vec<String>,
    pub ready_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub child_poll_interval: Duration,
    pub grace_period: Duration,
    pub max_heartbeat_failures: u32,
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let dependents = var("TASKQ_DEPENDENTS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|| vec!["taskq-api".to_string(), "taskq-worker".to_string()]);

        Ok(Self {
            store_program: var("TASKQ_STORE_BIN").unwrap_or_else(|| "taskq-store".to_string()),
            dependents,
            ready_timeout: secs_var("TASKQ_READY_TIMEOUT_SECS", 20)?,
            heartbeat_interval: secs_var("TASKQ_HEARTBEAT_SECS", 5)?,
            child_poll_interval: millis_var("TASKQ_CHILD_POLL_MS", 500)?,
            grace_period: secs_var("TASKQ_GRACE_SECS", 10)?,
            max_heartbeat_failures: parse_var(
                "TASKQ_MAX_HEARTBEAT_FAILURES",
                3,
                "must be a positive integer",
            )?,
        })
    }
}

/// A program plus its leading arguments, parsed from a whitespace separated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl FromStr for ToolCommand {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ConfigError::Invalid(raw.to_string(), "tool command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store_addr: SocketAddr,
    pub poll_interval: Duration,
    pub work_dir: PathBuf,
    pub tools: HashMap<TaskType, ToolCommand>,
    pub install_command: Option<ToolCommand>,
    pub watchdog: WatchdogConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let tools = tools_from_vars(env::vars())?;
        let install_command = var("TASKQ_INSTALL_CMD")
            .map(|raw| raw.parse::<ToolCommand>())
            .transpose()?;

        Ok(Self {
            store_addr: store_addr()?,
            poll_interval: millis_var("TASKQ_POLL_MS", 1000)?,
            work_dir: var("TASKQ_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DATA_DIR.as_str()).join("work")),
            tools,
            install_command,
            watchdog: watchdog_from_env()?,
        })
    }
}

/// Collects `TASKQ_TOOL_<TYPE>=program args` entries; `<TYPE>` is lowercased into a task type.
pub fn tools_from_vars<I>(vars: I) -> Result<HashMap<TaskType, ToolCommand>, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut tools = HashMap::new();
    for (key, value) in vars {
        let Some(suffix) = key.strip_prefix(TOOL_VAR_PREFIX) else {
            continue;
        };
        if suffix.is_empty() {
            continue;
        }
        let task_type = TaskType::from(suffix.to_ascii_lowercase().as_str());
        tools.insert(task_type, value.parse::<ToolCommand>()?);
    }
    Ok(tools)
}

fn watchdog_from_env() -> Result<WatchdogConfig, ConfigError> {
    let defaults = WatchdogConfig::default();
    Ok(WatchdogConfig {
        poll_interval: secs_var("TASKQ_WATCHDOG_POLL_SECS", defaults.poll_interval.as_secs())?,
        starting_timeout: secs_var(
            "TASKQ_WATCHDOG_STARTING_SECS",
            defaults.starting_timeout.as_secs(),
        )?,
        idle_timeout: secs_var("TASKQ_WATCHDOG_IDLE_SECS", defaults.idle_timeout.as_secs())?,
        busy_timeout: secs_var("TASKQ_WATCHDOG_BUSY_SECS", defaults.busy_timeout.as_secs())?,
        installing_timeout: secs_var(
            "TASKQ_WATCHDOG_INSTALLING_SECS",
            defaults.installing_timeout.as_secs(),
        )?,
    })
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub store_addr: SocketAddr,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: parse_var(
                "TASKQ_API_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 7200)),
                "must be host:port",
            )?,
            store_addr: store_addr()?,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
