use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber: human readable output on stderr plus a
/// daily rolling file `<log_dir>/<file_prefix>.log.<date>`.
///
/// stdout is left alone because it carries control lines (readiness, heartbeats).
/// Keep the returned guard alive for as long as the process should keep logging.
pub fn init(log_dir: impl AsRef<Path>, file_prefix: &str) -> anyhow::Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", file_prefix));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()?;

    Ok(guard)
}
