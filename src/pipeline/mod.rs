//! Pipeline controller and stage model
//!
//! Stages run strictly in order (scraping, processing, database update).
//! The controller persists the job status before and after each stage so
//! any restart can still report where the job stopped.

mod controller;
mod stage;

pub use controller::{ControlError, JobTicket, PipelineController, MAX_LOG_LINES};
pub use stage::{Stage, StageError, StageOutcome};
