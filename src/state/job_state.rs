/// Job state definitions for the pipeline state machine
///
/// A job moves `Idle -> Running -> {Completed | Failed | Cancelled}`. Terminal
/// states are frozen; the next job start supersedes them.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the lifecycle state of the current pipeline job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// No job has run, or the status was reset
    #[default]
    Idle,

    /// A job is executing its stages
    Running,

    // ===== Terminal States =====
    /// Every requested stage finished successfully
    Completed,

    /// A stage failed or an unexpected error aborted the job
    Failed,

    /// The job was cancelled on request
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Idle,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// Returns true if no further transitions occur for this job
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a new job may start from this state
    pub fn can_start_new(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Checks whether moving to `to` is a legal transition
    ///
    /// `Idle` is reachable from any state through a reset.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        match (self, to) {
            (_, Self::Idle) => true,
            (Self::Running, Self::Running) => false,
            (_, Self::Running) => true,
            (Self::Running, t) => t.is_terminal(),
            _ => false,
        }
    }

    /// Converts the job state to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a job state from a database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
