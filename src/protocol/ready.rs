use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{QueueError, Result};

pub const READY_PREFIX: &str = "SERVICE_READY";
pub const READY_VERSION: &str = "v1";

/// The control line `SERVICE_READY v1 <port>` a service prints once it accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadySignal {
    pub port: u16,
}

impl ReadySignal {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Prints the line on stdout and, if asked, mirrors it into `ready_file`
    /// through a temp file and a rename so readers never see a partial line.
    pub async fn announce(&self, ready_file: Option<&Path>) -> Result<()> {
        let line = format!("{}\n", self);
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;

        if let Some(path) = ready_file {
            let mut tmp = path.as_os_str().to_owned();
            tmp.push(".tmp");
            tokio::fs::write(&tmp, line.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await?;
            info!("Readiness written to {}", path.display());
        }
        Ok(())
    }
}

impl Display for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", READY_PREFIX, READY_VERSION, self.port)
    }
}

impl FromStr for ReadySignal {
    type Err = QueueError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [prefix, version, port] = parts.as_slice() else {
            return Err(QueueError::Protocol(format!("not a readiness line: {:?}", line)));
        };
        if *prefix != READY_PREFIX {
            return Err(QueueError::Protocol(format!("not a readiness line: {:?}", line)));
        }
        if *version != READY_VERSION {
            return Err(QueueError::Protocol(format!("unsupported readiness version: {}", version)));
        }
        match port.parse::<u16>() {
            Ok(port) if port != 0 => Ok(Self { port }),
            _ => Err(QueueError::Protocol(format!("invalid readiness port: {}", port))),
        }
    }
}
