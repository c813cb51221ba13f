//! State module for tracking pipeline jobs
//!
//! # Components
//!
//! - `JobState`: lifecycle state of a job (idle, running, completed, failed, cancelled)
//! - `Stage`: the ordered pipeline phases and their progress windows
//! - `JobStatus`: the persisted status record of the current job
//! - `HistoryRecord`: a status snapshot with its duration, kept in the history log

mod job_state;
mod job_status;
mod stage;

// Re-export main types
pub use job_state::JobState;
pub use job_status::{HistoryPage, HistoryRecord, ImportStats, JobStatus};
pub use stage::Stage;
