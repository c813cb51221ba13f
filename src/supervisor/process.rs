//! Child process launch, cancellable wait and bounded runs

use crate::supervisor::tail::{spawn_tailer, LogSink};
use crate::supervisor::{pid_alive, SupervisorError};
use std::future::pending;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How long to wait for the log tailer to drain after the child exited
const TAIL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A program with arguments, working directory and extra environment
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn work_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.work_dir = dir;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments as one line, for logs
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }
        // Own process group, so signals reach grandchildren too
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    fn spawn(&self) -> Result<Child, SupervisorError> {
        self.to_command()
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                program: self.program.display().to_string(),
                source,
            })
    }
}

/// A running supervised child and its log tailer
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    tailer: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own; `None` when killed by a signal
    Exited(Option<i32>),

    /// Cancellation was requested; the process was stopped
    Cancelled,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }
}

/// Captured result of a bounded run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl BoundedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// How a bounded run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundedOutcome {
    Finished(BoundedOutput),
    Cancelled,
}

/// Single owner of the current child process
///
/// Callers never touch the raw child handle. The pid of the live
/// long-running child is kept behind a mutex so `terminate_current` can
/// reach it from another task.
pub struct ProcessSupervisor {
    sink: LogSink,
    current: Mutex<Option<u32>>,
}

impl ProcessSupervisor {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink,
            current: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Pid of the live supervised child, if any
    pub fn current_pid(&self) -> Option<u32> {
        self.current.lock().ok().and_then(|pid| *pid)
    }

    /// Returns true if a supervised child is running in this process
    pub fn is_alive(&self) -> bool {
        self.current_pid().map_or(false, pid_alive)
    }

    /// Launches a long-running child with live log capture
    ///
    /// Output is drained from the moment the child starts.
    ///
    /// # Returns
    ///
    /// * `Ok(ProcessHandle)` - The child is running
    /// * `Err(SupervisorError::Launch)` - The program could not be started
    pub fn launch(&self, command: &LaunchCommand) -> Result<ProcessHandle, SupervisorError> {
        if let Err(e) = self.sink.append_line(&format!("=== Starting: {} ===", command.display())) {
            tracing::warn!("Cannot write to log sink {}: {}", self.sink.path().display(), e);
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let tailer = spawn_tailer(self.sink.clone(), child.stdout.take(), child.stderr.take());
        self.set_current(pid);

        tracing::info!(pid = ?pid, "Launched {}", command.display());
        Ok(ProcessHandle { child, pid, tailer })
    }

    /// Waits for the child, polling for cancellation
    ///
    /// On cancellation the child gets a terminate signal, then a kill once
    /// `grace` elapses. A cancellation seen after a natural exit still
    /// reports [`ExitOutcome::Cancelled`].
    ///
    /// # Arguments
    ///
    /// * `handle` - The child returned by [`ProcessSupervisor::launch`]
    /// * `poll_interval` - How often `cancel_check` runs
    /// * `grace` - Time between terminate and kill
    /// * `cancel_check` - Returns true once cancellation was requested
    pub async fn await_with_cancellation<F>(
        &self,
        mut handle: ProcessHandle,
        poll_interval: Duration,
        grace: Duration,
        cancel_check: F,
    ) -> Result<ExitOutcome, SupervisorError>
    where
        F: Fn() -> bool,
    {
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let waited = loop {
            tokio::select! {
                status = handle.child.wait() => {
                    break status.map_err(SupervisorError::from).map(|status| {
                        if cancel_check() {
                            ExitOutcome::Cancelled
                        } else {
                            ExitOutcome::Exited(status.code())
                        }
                    });
                }
                _ = ticker.tick() => {
                    if cancel_check() {
                        tracing::info!(pid = ?handle.pid, "Cancellation requested, stopping child");
                        break stop_child(&mut handle.child, handle.pid, grace)
                            .await
                            .map(|_| ExitOutcome::Cancelled);
                    }
                }
            }
        };

        self.clear_current(handle.pid);
        drain_tailer(&mut handle.tailer).await;

        let outcome = waited?;
        if let Err(e) = self.sink.append_line(&format!("=== Finished: {:?} ===", outcome)) {
            tracing::warn!("Cannot write to log sink: {}", e);
        }
        Ok(outcome)
    }

    /// Stops a launched child that will not be awaited
    ///
    /// Same terminate, grace, kill sequence as a cancellation. The pid is
    /// no longer reported as current afterwards.
    pub async fn abandon(
        &self,
        mut handle: ProcessHandle,
        grace: Duration,
    ) -> Result<(), SupervisorError> {
        tracing::warn!(pid = ?handle.pid, "Abandoning child");
        let stopped = stop_child(&mut handle.child, handle.pid, grace).await;
        self.clear_current(handle.pid);
        drain_tailer(&mut handle.tailer).await;
        stopped
    }

    /// Sends a terminate signal to the current child, if any
    ///
    /// Returns true if a child was signalled.
    pub fn terminate_current(&self) -> bool {
        let Some(pid) = self.current_pid() else {
            return false;
        };

        match signal_terminate(pid) {
            Ok(()) => {
                tracing::info!(pid, "Sent terminate signal");
                true
            }
            Err(e) => {
                tracing::warn!(pid, "Failed to signal child: {}", e);
                false
            }
        }
    }

    /// Runs a short-lived command to completion under a wall-clock limit
    ///
    /// Stdout and stderr are captured whole. Exceeding `limit` kills the
    /// command and is reported as [`SupervisorError::Timeout`].
    pub async fn run_bounded<F>(
        &self,
        command: &LaunchCommand,
        limit: Option<Duration>,
        poll_interval: Duration,
        cancel_check: F,
    ) -> Result<BoundedOutcome, SupervisorError>
    where
        F: Fn() -> bool,
    {
        let child = command.spawn()?;
        let pid = child.id();
        tracing::info!(pid = ?pid, limit = ?limit, "Running {}", command.display());

        let output = child.wait_with_output();
        tokio::pin!(output);

        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut output => {
                    let output = result?;
                    return Ok(BoundedOutcome::Finished(BoundedOutput {
                        code: output.status.code(),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }));
                }
                _ = &mut deadline => {
                    tracing::warn!(pid = ?pid, "Command exceeded its time limit, killing it");
                    kill_group(pid);
                    return Err(SupervisorError::Timeout {
                        limit: limit.unwrap_or_default(),
                    });
                }
                _ = ticker.tick() => {
                    if cancel_check() {
                        tracing::info!(pid = ?pid, "Cancellation requested, killing command");
                        kill_group(pid);
                        return Ok(BoundedOutcome::Cancelled);
                    }
                }
            }
        }
    }

    fn set_current(&self, pid: Option<u32>) {
        if let Ok(mut current) = self.current.lock() {
            *current = pid;
        }
    }

    fn clear_current(&self, pid: Option<u32>) {
        if let Ok(mut current) = self.current.lock() {
            if *current == pid {
                *current = None;
            }
        }
    }
}

/// Stops the process group of a pid this process did not spawn
///
/// Used for a crawl left behind by an earlier controller process. The
/// group gets a terminate signal, then a kill once `grace` elapses.
///
/// # Returns
///
/// * `Ok(true)` - The pid is gone
/// * `Ok(false)` - The pid still exists after the kill
pub async fn stop_process_group(
    pid: u32,
    grace: Duration,
    poll_interval: Duration,
) -> Result<bool, SupervisorError> {
    signal_terminate(pid)?;
    if wait_for_exit(pid, grace, poll_interval).await {
        tracing::info!(pid, "Process group exited after terminate signal");
        return Ok(true);
    }

    tracing::warn!(pid, "Process still alive after {:?}, killing its group", grace);
    kill_group(Some(pid));
    Ok(wait_for_exit(pid, grace, poll_interval).await)
}

/// Polls until `pid` disappears or `limit` elapses
async fn wait_for_exit(pid: u32, limit: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.max(Duration::from_millis(10))).await;
    }
}

async fn drain_tailer(tailer: &mut JoinHandle<()>) {
    if tokio::time::timeout(TAIL_DRAIN_TIMEOUT, &mut *tailer)
        .await
        .is_err()
    {
        tracing::warn!("Log tailer still busy after child exit, detaching it");
        tailer.abort();
    }
}

/// Terminate, wait up to `grace`, then kill
async fn stop_child(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> Result<(), SupervisorError> {
    if let Some(pid) = pid {
        if let Err(e) = signal_terminate(pid) {
            tracing::warn!(pid, "Terminate signal failed: {}", e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            status?;
            tracing::info!(pid = ?pid, "Child exited after terminate signal");
        }
        Err(_) => {
            tracing::warn!(pid = ?pid, "Child still alive after {:?}, killing it", grace);
            kill_group(pid);
            child.kill().await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> Result<(), SupervisorError> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> Result<(), SupervisorError> {
    // No graceful path; the kill after the grace period stops the child
    Ok(())
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| SupervisorError::Signal(format!("invalid pid {}", pid)))?;
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal(format!("{:?} to {}: {}", signal, pid, e))),
    }
}

/// Best-effort kill of a child's whole process group
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            if let Err(e) = signal_group(pid, nix::sys::signal::Signal::SIGKILL) {
                tracing::warn!(pid, "Kill failed: {}", e);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
