//! Process supervisor for pipeline stages
//!
//! This module runs stages as isolated child processes:
//! - Long-running children (the crawl) with live, timestamped log capture
//! - A wait loop that polls for exit and cancellation, escalating from a
//!   terminate signal to a kill after a grace period
//! - Short-lived bounded commands with a hard wall-clock limit
//! - Liveness checks for pids recorded by an earlier controller process

mod process;
mod tail;

pub use process::{
    stop_process_group, BoundedOutcome, BoundedOutput, ExitOutcome, LaunchCommand, ProcessHandle,
    ProcessSupervisor,
};
pub use tail::{spawn_tailer, LogSink, LOG_TIMESTAMP_FORMAT};

use std::time::Duration;
use thiserror::Error;

/// Errors raised while supervising a child process
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {}s", .limit.as_secs())]
    Timeout { limit: Duration },

    #[error("signal delivery failed: {0}")]
    Signal(String),
}

/// Returns true if a process with this pid exists
///
/// Signal 0 checks for existence without delivering anything.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
