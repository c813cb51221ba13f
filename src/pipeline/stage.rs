//! Stage-level outcomes and failures

pub use crate::state::Stage;

use crate::supervisor::SupervisorError;
use crate::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// How a stage ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Cancelled,
}

/// A stage failure; its message becomes the job's error message
#[derive(Debug, Error)]
pub enum StageError {
    /// Missing or invalid configuration; nothing was launched
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{} could not start: {source}", .stage.title())]
    Launch {
        stage: Stage,
        #[source]
        source: SupervisorError,
    },

    #[error("{} failed (return code {}): {context}", .stage.title(), code_label(.code))]
    Exit {
        stage: Stage,
        code: Option<i32>,
        context: String,
    },

    #[error("{} timed out after {}s", .stage.title(), .limit.as_secs())]
    Timeout { stage: Stage, limit: Duration },

    #[error("{0}")]
    Internal(String),
}

fn code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| c.to_string())
}
