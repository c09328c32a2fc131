use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::core::bot::BotId;
use crate::core::error::{EXIT_UNKNOWN, FailureReason};
use crate::host::{Host, NativeHost};

/// Line a bot runner prints on stdout once its adapter is connected.
pub const READY_MARKER: &str = "BOTDECK_READY";

/// How long to wait for the stderr pipe to drain after an exit before the
/// tail is captured.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Builds the command that runs one bot as a child process.
pub trait BotLauncher: Send + Sync {
    fn command(&self, id: &BotId) -> std::io::Result<Command>;
}

/// Re-executes the current binary as `botdeck run-bot --bot-id <id>`.
pub struct SelfExecLauncher {
    exe: PathBuf,
    data_dir: PathBuf,
}

impl SelfExecLauncher {
    pub fn new(exe: PathBuf, data_dir: PathBuf) -> Self {
        Self { exe, data_dir }
    }

    pub fn current(data_dir: PathBuf) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, data_dir))
    }
}

impl BotLauncher for SelfExecLauncher {
    fn command(&self, id: &BotId) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("run-bot")
            .arg("--bot-id")
            .arg(id.as_str())
            .arg("--data-dir")
            .arg(&self.data_dir);
        Ok(cmd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    WaitFailed(String),
}

impl ExitOutcome {
    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signaled(signal);
            }
        }
        ExitOutcome::Exited(EXIT_UNKNOWN)
    }

    /// `None` for a clean exit.
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            ExitOutcome::Exited(0) => None,
            ExitOutcome::Exited(code) => Some(FailureReason::from_exit_code(*code)),
            ExitOutcome::Signaled(signal) => Some(FailureReason::Signal(*signal)),
            ExitOutcome::WaitFailed(e) => Some(FailureReason::WaitFailed(e.clone())),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit code {}", code),
            ExitOutcome::Signaled(signal) => write!(f, "signal {}", signal),
            ExitOutcome::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Bounded ring of the most recent stderr lines.
#[derive(Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

impl std::fmt::Debug for StderrTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StderrTail")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum ProcessCommand {
    Terminate,
    Kill,
}

/// Handle to a spawned bot process. The `Child` itself is owned by a
/// monitor task; this side only sends commands and observes the exit.
pub struct TrackedProcess {
    pub pid: u32,
    pub generation: u64,
    pub stderr: StderrTail,
    commands: mpsc::Sender<ProcessCommand>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    ready: watch::Receiver<bool>,
    stderr_closed: watch::Receiver<bool>,
}

impl TrackedProcess {
    pub fn spawn(
        launcher: &dyn BotLauncher,
        id: &BotId,
        generation: u64,
        stderr_lines: usize,
    ) -> std::io::Result<Self> {
        let mut cmd = launcher.command(id)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        NativeHost::isolate_process_group(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("child exited before its pid could be read")
        })?;

        let (ready_tx, ready) = watch::channel(false);
        if let Some(stdout) = child.stdout.take() {
            let bot_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim() == READY_MARKER {
                        ready_tx.send_replace(true);
                    } else {
                        debug!(bot_id = %bot_id, "stdout: {}", line);
                    }
                }
            });
        }

        let stderr = StderrTail::new(stderr_lines);
        let (closed_tx, stderr_closed) = watch::channel(false);
        match child.stderr.take() {
            Some(pipe) => {
                let bot_id = id.clone();
                let tail = stderr.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(pipe).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(bot_id = %bot_id, "stderr: {}", line);
                        tail.push(line);
                    }
                    closed_tx.send_replace(true);
                });
            }
            None => {
                closed_tx.send_replace(true);
            }
        }

        let (commands, command_rx) = mpsc::channel(4);
        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(monitor(child, pid, id.clone(), command_rx, exit_tx));

        Ok(Self {
            pid,
            generation,
            stderr,
            commands,
            exit,
            ready,
            stderr_closed,
        })
    }

    /// The exit, if the monitor has already observed one.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit.clone()
    }

    pub async fn wait_exit(&self) -> ExitOutcome {
        wait_for_exit(self.exit.clone()).await
    }

    /// Resolves once the ready marker has been seen. Never resolves if
    /// stdout closes without one.
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.clone();
        if ready.wait_for(|seen| *seen).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub async fn terminate(&self) {
        let _ = self.commands.send(ProcessCommand::Terminate).await;
    }

    pub async fn kill(&self) {
        let _ = self.commands.send(ProcessCommand::Kill).await;
    }

    /// Stderr lines captured so far, after giving the pipe a moment to
    /// drain when the process has just exited.
    pub async fn stderr_tail(&self) -> Vec<String> {
        let mut closed = self.stderr_closed.clone();
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, async {
            let _ = closed.wait_for(|done| *done).await;
        })
        .await;
        self.stderr.lines()
    }
}

pub async fn wait_for_exit(mut exit: watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    let observed = match exit.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    };
    observed.unwrap_or_else(|| ExitOutcome::WaitFailed("process monitor ended".into()))
}

async fn monitor(
    mut child: Child,
    pid: u32,
    bot_id: BotId,
    mut commands: mpsc::Receiver<ProcessCommand>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitOutcome::from_status(status),
                    Err(e) => ExitOutcome::WaitFailed(e.to_string()),
                };
            }
            Some(command) = commands.recv() => match command {
                ProcessCommand::Terminate => {
                    if let Err(e) = NativeHost::terminate_group(pid) {
                        warn!(bot_id = %bot_id, pid, "Failed to signal process group: {}", e);
                    }
                }
                ProcessCommand::Kill => {
                    if let Err(e) = NativeHost::kill_group(pid) {
                        warn!(bot_id = %bot_id, pid, "Failed to kill process group: {}", e);
                    }
                    let _ = child.start_kill();
                }
            },
        }
    };
    debug!(bot_id = %bot_id, pid, "Process exited with {}", outcome);
    exit_tx.send_replace(Some(outcome));
}
