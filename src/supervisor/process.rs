//! Child process plumbing: spawning, stdio pumps, and termination.
//!
//! Stdout lines that parse as JSON are published on the process's
//! `StdioChannel`; every other stdout line, and all of stderr, is only
//! checked for readiness. Stderr is also kept in a rolling buffer.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{resolve_env_vars, ServerDescriptor};
use crate::error::GatewayError;
use crate::supervisor::readiness::{Readiness, ReadinessProbe};

/// Lines of stderr kept per server.
pub const STDERR_LINES: usize = 100;

const STDIN_QUEUE: usize = 64;
const STDOUT_FANOUT: usize = 256;

/// Rolling buffer for per-server stderr output, for diagnostics.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a line, evicting the oldest at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }
}

/// Line-oriented channel onto a running process: write to its stdin,
/// subscribe to the JSON lines it prints.
#[derive(Debug, Clone)]
pub struct StdioChannel {
    server_id: Arc<str>,
    stdin: mpsc::Sender<String>,
    stdout: broadcast::Sender<String>,
}

impl StdioChannel {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Queue one line for the process's stdin. The newline is added here.
    pub async fn send_line(&self, line: impl Into<String>) -> crate::Result<()> {
        self.stdin.send(line.into()).await.map_err(|_| {
            GatewayError::Unavailable(self.server_id.to_string(), "stdin closed".to_string())
        })
    }

    /// Receive JSON lines printed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.stdout.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.stdin.is_closed()
    }
}

/// A freshly spawned child with its pumps running.
pub(crate) struct SpawnedChild {
    pub child: Child,
    pub pid: Option<u32>,
    pub channel: StdioChannel,
    pub readiness: watch::Receiver<Readiness>,
    pub readiness_tx: Arc<watch::Sender<Readiness>>,
}

/// Spawn the child process for `descriptor` and start its stdio pumps.
///
/// The pumps stop when `cancel` fires or the pipes close; stdin is closed
/// as soon as `cancel` fires.
pub(crate) fn spawn_child(
    descriptor: &ServerDescriptor,
    probe: Arc<ReadinessProbe>,
    stderr_buf: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) -> crate::Result<SpawnedChild> {
    let id = descriptor.id.as_str();
    let command = descriptor.command.as_ref().ok_or_else(|| {
        GatewayError::Configuration(
            id.to_string(),
            "process transport requires 'command' field".to_string(),
        )
    })?;

    let mut cmd = Command::new(command);

    if !descriptor.args.is_empty() {
        cmd.args(&descriptor.args);
    }

    if !descriptor.env.is_empty() {
        cmd.envs(resolve_env_vars(&descriptor.env));
    }

    if let Some(ref cwd) = descriptor.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| GatewayError::Spawn(id.to_string(), e.to_string()))?;

    let pipe_error = |name: &str| GatewayError::Spawn(id.to_string(), format!("failed to open {name} pipe"));
    let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

    let (readiness_tx, readiness) = watch::channel(Readiness::Pending);
    let readiness_tx = Arc::new(readiness_tx);
    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
    let (stdout_tx, _) = broadcast::channel(STDOUT_FANOUT);

    start_stdin_writer(stdin, id.to_string(), stdin_rx, cancel.clone());
    start_stdout_reader(
        stdout,
        id.to_string(),
        stdout_tx.clone(),
        Arc::clone(&probe),
        Arc::clone(&readiness_tx),
        cancel.clone(),
    );
    start_stderr_drain(
        stderr,
        id.to_string(),
        stderr_buf,
        probe,
        Arc::clone(&readiness_tx),
        cancel,
    );

    let pid = child.id();
    tracing::debug!(server = %id, pid = ?pid, command = %command, "process spawned");

    Ok(SpawnedChild {
        child,
        pid,
        channel: StdioChannel {
            server_id: Arc::from(id),
            stdin: stdin_tx,
            stdout: stdout_tx,
        },
        readiness,
        readiness_tx,
    })
}

fn start_stdin_writer(
    mut stdin: ChildStdin,
    server_id: String,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_line = rx.recv() => {
                    let Some(line) = maybe_line else { break };
                    let with_newline = format!("{}\n", line);
                    if let Err(e) = stdin.write_all(with_newline.as_bytes()).await {
                        tracing::debug!(server = %server_id, error = %e, "stdin write failed");
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        // stdin dropped here, closing the pipe
    });
}

fn start_stdout_reader(
    stdout: ChildStdout,
    server_id: String,
    tx: broadcast::Sender<String>,
    probe: Arc<ReadinessProbe>,
    readiness: Arc<watch::Sender<Readiness>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
                                // No subscribers is fine
                                let _ = tx.send(line);
                            } else {
                                tracing::debug!(server = %server_id, line = %line, "server stdout");
                                probe.observe(&line, &readiness);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

fn start_stderr_drain(
    stderr: ChildStderr,
    server_id: String,
    buffer: Arc<Mutex<StderrBuffer>>,
    probe: Arc<ReadinessProbe>,
    readiness: Arc<watch::Sender<Readiness>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %server_id, line = %line, "server stderr");
                            probe.observe(&line, &readiness);
                            buffer.lock().await.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Failures are logged, never returned.
pub(crate) async fn terminate(child: &mut Child, server_id: &str, grace: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        signal_terminate(pid, server_id);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server = %server_id, status = %status, "process terminated gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            tracing::warn!(server = %server_id, error = %e, "error waiting for process");
            None
        }
        Err(_) => {
            tracing::warn!(
                server = %server_id,
                grace_ms = grace.as_millis() as u64,
                "process did not exit within grace period, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(server = %server_id, error = %e, "failed to kill process");
            }
            child.try_wait().ok().flatten()
        }
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32, server_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = kill(target, Signal::SIGTERM) {
        tracing::debug!(server = %server_id, pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32, _server_id: &str) {}

/// Whether a process with this pid still exists.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);
    kill(pid, None).is_ok()
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: u32) -> bool {
    // The exit watcher is the only signal available here
    true
}

/// Exit code and terminating signal, whichever apply.
pub(crate) fn exit_parts(status: Option<ExitStatus>) -> (Option<i32>, Option<i32>) {
    let Some(status) = status else {
        return (None, None);
    };
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    (status.code(), signal)
}
