//! Launching shell commands as OS processes
//!
//! A [`ProcessLauncher`] starts one OS process per call and reports what
//! happened to it through a [`Launch`]: exactly one [`LaunchEvent`] arrives
//! on `events`, and `handle` can ask the process to terminate at any time,
//! including after it has already exited.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LauncherConfig;
use crate::error::Result;

/// How a launched process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, absent when the process was killed by a signal
    pub code: Option<i32>,
    /// Terminating OS signal (Unix only)
    pub signal: Option<i32>,
}

impl ExitReport {
    /// Report for a process that exited with `code`
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Report for a process killed by OS signal `signal`
    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Notification about a launched process
#[derive(Debug)]
pub enum LaunchEvent {
    /// The process could not be started
    SpawnError(io::Error),
    /// The process ended
    Exited(ExitReport),
}

/// Control over one launched process
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if the process was started
    fn pid(&self) -> Option<u32>;

    /// Ask the process to terminate
    ///
    /// Idempotent, and a no-op once the process has exited.
    fn terminate(&self);
}

/// A started (or failed-to-start) process
pub struct Launch {
    pub handle: Box<dyn ProcessHandle>,
    pub events: mpsc::UnboundedReceiver<LaunchEvent>,
}

/// Starts OS processes for shell commands
pub trait ProcessLauncher: Send + Sync {
    /// Start `command`
    ///
    /// Spawn failures are reported through the returned events, never by
    /// panicking or returning early.
    fn start(&self, command: &str) -> Launch;
}

/// Launcher running commands through a shell with inherited stdio
///
/// Must be used from within a Tokio runtime: every started process is
/// watched by a spawned task.
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher {
    config: LauncherConfig,
}

impl ShellLauncher {
    /// Create a launcher from validated configuration
    pub fn new(config: LauncherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get launcher configuration
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }
}

impl ProcessLauncher for ShellLauncher {
    fn start(&self, command: &str) -> Launch {
        debug!(
            command = %command,
            shell = %self.config.shell,
            "Spawning process"
        );

        let (events_tx, events) = mpsc::unbounded_channel();

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg(&self.config.shell_arg)
            .arg(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                info!(pid = ?pid, command = %command, "Process spawned");

                let kill = CancellationToken::new();
                tokio::spawn(watch_child(
                    child,
                    pid,
                    kill.clone(),
                    self.config.grace(),
                    events_tx,
                ));

                Launch {
                    handle: Box::new(ShellHandle { pid, kill }),
                    events,
                }
            }
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to spawn process");
                // The receiver is still held by `events`, so this cannot fail.
                let _ = events_tx.send(LaunchEvent::SpawnError(e));

                Launch {
                    handle: Box::new(ShellHandle {
                        pid: None,
                        kill: CancellationToken::new(),
                    }),
                    events,
                }
            }
        }
    }
}

struct ShellHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle for ShellHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) {
        self.kill.cancel();
    }
}

/// Wait for `child` to exit, terminating it if `kill` fires first, and
/// report the exit.
async fn watch_child(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    grace: Duration,
    events: mpsc::UnboundedSender<LaunchEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => terminate_child(&mut child, pid, grace).await,
    };

    let report = match status {
        Ok(status) => ExitReport::from(status),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Error waiting for process");
            ExitReport::default()
        }
    };
    debug!(
        pid = ?pid,
        code = ?report.code,
        signal = ?report.signal,
        "Process exited"
    );

    // Nobody listens any more once the run was decided some other way.
    let _ = events.send(LaunchEvent::Exited(report));
}

/// Polite termination first, SIGKILL once that fails or `grace` runs out
async fn terminate_child(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> io::Result<ExitStatus> {
    if let Some(pid) = pid {
        if let Some(status) = request_termination(child, pid, grace).await {
            return status;
        }
    }

    if let Err(e) = child.kill().await {
        warn!(pid = ?pid, error = %e, "Failed to kill process");
    }
    child.wait().await
}

/// Send SIGTERM and wait up to `grace`; `None` means escalate
#[cfg(unix)]
async fn request_termination(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> Option<io::Result<ExitStatus>> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid = %pid, error = %e, "Failed to send SIGTERM, killing process");
        return None;
    }
    debug!(pid = %pid, "Sent SIGTERM to process");

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Some(status),
        Err(_) => {
            warn!(pid = %pid, "Process outlived grace period, sending SIGKILL");
            None
        }
    }
}

#[cfg(not(unix))]
async fn request_termination(
    _child: &mut Child,
    _pid: u32,
    _grace: Duration,
) -> Option<io::Result<ExitStatus>> {
    None
}
