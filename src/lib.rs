pub mod config;
pub mod error;
pub mod protocol;
pub mod schedule;
pub mod storage;
pub mod supervisor;
pub mod utils;
pub mod watchdog;
pub mod web;

use std::env;
use once_cell::sync::Lazy;

pub use error::{QueueError, Result};

const TASKQ_DATA_DIR: &str = "./taskq_data";

pub static DATA_DIR: Lazy<String> = Lazy::new(|| {
    match env::var("TASKQ_DATA_DIR") {
        Ok(path) => path,
        Err(_) => {
            dotenv::var("TASKQ_DATA_DIR").unwrap_or_else(|_| TASKQ_DATA_DIR.to_string())
        }
    }
});

pub static DATABASE_PATH: Lazy<String> = Lazy::new(|| {
    std::path::Path::new(DATA_DIR.as_str())
        .join("database")
        .join("tasks.db")
        .to_string_lossy()
        .into_owned()
});

/// Log directory shared by every taskq process.
pub static LOG_DIR: Lazy<String> = Lazy::new(|| {
    match env::var("TASKQ_LOG_DIR") {
        Ok(path) => path,
        Err(_) => dotenv::var("TASKQ_LOG_DIR").unwrap_or_else(|_| "./logs".to_string()),
    }
});

pub fn init_env() {
    dotenv::dotenv().ok();

    // 确保数据目录存在
    std::fs::create_dir_all(DATA_DIR.as_str()).unwrap_or_else(|e| {
        eprintln!("Failed to create data directory: {}", e);
    });
}
