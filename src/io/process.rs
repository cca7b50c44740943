//! Process management layer
//!
//! Owns the downstream child process: spawning it with piped stdio,
//! draining its stderr into the diagnostic log, and the terminate-and-wait
//! sequence that must run before the proxy exits.

use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long to wait for the stderr drain task after the child has exited
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Default time between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Process State Management
// ============================================================================

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited; `exit_code` is `None` when it was killed by a signal
    Stopped { exit_code: Option<i32> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// Must be called before the process starts. Only one handler can be
    /// active; installing a new one replaces the previous one. Without a
    /// handler stderr is still drained so the child never blocks on a full pipe.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,
}

/// Manages the single downstream child process
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Time allowed between SIGTERM and SIGKILL
    terminate_grace: Duration,

    state: ProcessState,

    /// The child itself; `None` before start and after terminate_and_wait
    child: Option<Child>,

    /// Pipes handed out by `take_stdio`
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,

    /// Stderr handler
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,

    /// Stderr monitoring task handle
    stderr_task: Option<JoinHandle<()>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The executable to run (resolved through `PATH`)
    /// * `args` - Command line arguments
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            state: ProcessState::NotStarted,
            child: None,
            stdin: None,
            stdout: None,
            stderr_handler: None,
            stderr_task: None,
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Spawn the process with all three stdio streams piped
    pub async fn start(&mut self) -> Result<u32, ProcessError> {
        if !matches!(self.state, ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| {
            ProcessError::Io(io::Error::other("Failed to get process ID"))
        })?;
        info!("Process started with PID: {}", pid);

        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_monitor(stderr);
        }

        self.child = Some(child);
        self.state = ProcessState::Running { pid };
        Ok(pid)
    }

    /// Hand out the child's stdin and stdout; can only be done once
    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout), ProcessError> {
        if matches!(self.state, ProcessState::NotStarted) {
            return Err(ProcessError::NotStarted);
        }
        let stdin = self.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = self.stdout.take().ok_or(ProcessError::StdoutNotAvailable)?;
        Ok((stdin, stdout))
    }

    /// Terminate the process and wait for it to exit
    ///
    /// Sends SIGTERM, waits up to the terminate grace, then falls back to
    /// SIGKILL and reaps the child. Returns the exit code when the process
    /// exited normally. Calling this again after it completed is a no-op.
    pub async fn terminate_and_wait(&mut self) -> Result<Option<i32>, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(match &self.state {
                ProcessState::Stopped { exit_code } => *exit_code,
                _ => None,
            });
        };

        // Dropping an unclaimed stdin lets the child see EOF
        self.stdin.take();
        self.stdout.take();

        let status = match child.try_wait()? {
            Some(status) => {
                debug!("Process already exited with status: {}", status);
                status
            }
            None => {
                self.send_sigterm(&child);
                match tokio::time::timeout(self.terminate_grace, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(
                            "Process did not exit within {:?} of SIGTERM, sending SIGKILL",
                            self.terminate_grace
                        );
                        child.kill().await?;
                        child.wait().await?
                    }
                }
            }
        };

        info!("Process exited with status: {}", status);
        let exit_code = status.code();
        self.state = ProcessState::Stopped { exit_code };

        if let Some(mut task) = self.stderr_task.take() {
            if tokio::time::timeout(STDERR_FLUSH_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                trace!("ChildProcessManager: stderr still open after exit, aborting drain");
                task.abort();
            }
        }

        Ok(exit_code)
    }

    fn send_sigterm(&self, child: &Child) {
        let Some(pid) = child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                info!("Sent SIGTERM to process {}", pid);
            } else {
                warn!(
                    "Failed to send SIGTERM to process {}: {}",
                    pid,
                    io::Error::last_os_error()
                );
            }
        }
        #[cfg(not(unix))]
        {
            warn!(
                "No SIGTERM on this platform, process {} will be killed after the grace period",
                pid
            );
        }
    }

    /// Synchronous force kill for Drop
    ///
    /// Skips waiting; tokio reaps the orphaned child in the background.
    fn kill_sync(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(
                "ChildProcessManager dropped without terminate_and_wait, killing {}",
                self.command
            );
            if let Err(e) = child.start_kill() {
                error!("Failed to kill process: {}", e);
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    /// Spawn the stderr monitoring task
    ///
    /// Always drains stderr to prevent the child from blocking.
    /// If a handler is installed, lines are forwarded to it.
    fn spawn_stderr_monitor(&mut self, stderr: tokio::process::ChildStderr) {
        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        // Diagnostics only; bad bytes must not stop the drain
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        match handler {
                            Some(ref handler) => handler(line.to_string()),
                            None => trace!("ChildProcessManager: stderr drained: {}", line),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }
        });

        self.stderr_task = Some(task);
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}
