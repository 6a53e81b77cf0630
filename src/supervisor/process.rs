use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{info, warn};

use crate::error::{QueueError, Result};
use crate::protocol::ready::{ReadySignal, READY_PREFIX};

/// Finds `program` next to the running executable, falling back to a `PATH` lookup.
pub fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(program)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(program))
}

/// A child process started by the supervisor. Output lines are forwarded into
/// the supervisor's log tagged with the child's name.
pub struct ManagedChild {
    name: String,
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
}

impl ManagedChild {
    /// Starts `program` in its own process group so a watchdog kill inside the
    /// child cannot reach the supervisor.
    pub fn spawn(name: &str, program: &Path, args: &[String], envs: &[(&str, String)]) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for (key, value) in envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| QueueError::ChildProcessDied {
            name: name.to_string(),
            status: format!("failed to start {}: {}", program.display(), e),
        })?;
        info!(child = name, pid = ?child.id(), "Started {}", program.display());

        if let Some(stderr) = child.stderr.take() {
            forward_lines(name.to_string(), BufReader::new(stderr).lines());
        }
        let stdout = child.stdout.take().map(|out| BufReader::new(out).lines());

        Ok(Self {
            name: name.to_string(),
            child,
            stdout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Forwards stdout into the log from now on.
    pub fn forward_stdout(&mut self) {
        if let Some(lines) = self.stdout.take() {
            forward_lines(self.name.clone(), lines);
        }
    }

    /// Reads stdout until the readiness line shows up, then forwards the rest.
    /// Any other line is logged. A line that starts like a readiness line but
    /// does not parse is an error.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<ReadySignal> {
        let name = self.name.clone();
        let Some(mut lines) = self.stdout.take() else {
            return Err(QueueError::Protocol(format!("{}: stdout is not readable", name)));
        };

        let signal = tokio::time::timeout(timeout, read_until_ready(&name, &mut lines))
            .await
            .map_err(|_| QueueError::Timeout(format!("{} not ready within {:?}", name, timeout)))??;

        forward_lines(name, lines);
        Ok(signal)
    }

    /// `Some(status)` once the child has exited.
    pub fn try_exited(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!(child = %self.name, %status, "Already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(child = %self.name, "Failed to poll: {}", e),
        }

        let pid = self.child.id().map(|pid| Pid::from_raw(pid as i32));
        if let Some(pid) = pid {
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                warn!(child = %self.name, "Failed to send SIGTERM: {}", e);
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(child = %self.name, %status, "Stopped"),
            Ok(Err(e)) => warn!(child = %self.name, "Failed to wait: {}", e),
            Err(_) => {
                warn!(child = %self.name, "Still running after {:?}, killing its process group", grace);
                // the child leads its own group; this also reaches the tools it started
                if let Some(pid) = pid {
                    if let Err(e) = killpg(pid, Signal::SIGKILL) {
                        warn!(child = %self.name, "Failed to kill process group: {}", e);
                    }
                }
                if let Err(e) = self.child.kill().await {
                    warn!(child = %self.name, "Failed to kill: {}", e);
                }
            }
        }
    }
}

async fn read_until_ready(name: &str, lines: &mut Lines<BufReader<ChildStdout>>) -> Result<ReadySignal> {
    while let Some(line) = lines.next_line().await? {
        if line.trim_start().starts_with(READY_PREFIX) {
            return line.parse();
        }
        info!(child = name, "{}", line);
    }
    Err(QueueError::ChildProcessDied {
        name: name.to_string(),
        status: "exited before signalling readiness".to_string(),
    })
}

fn forward_lines<R>(name: String, mut lines: Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(child = %name, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(child = %name, "Output stream failed: {}", e);
                    break;
                }
            }
        }
    });
}
