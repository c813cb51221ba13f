//! Storage traits and error types
//!
//! This module defines the trait interface for status store backends and
//! associated error types.

use crate::state::{HistoryPage, JobState, JobStatus};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Status store lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History record not found: {0}")]
    NotFound(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable owner of the current job status and the history log
///
/// Every write replaces the whole status record and upserts the matching
/// history snapshot. Implementations are shared across tasks behind an
/// `Arc` and must serialize their own writes.
pub trait StatusStore: Send + Sync {
    /// Loads the latest persisted status, or an idle status if none exists
    fn load(&self) -> StorageResult<JobStatus>;

    /// Overwrites the current status record
    ///
    /// A pending cancellation request for the same job id survives the write.
    fn save(&self, status: &JobStatus) -> StorageResult<()>;

    /// Atomically replaces the status if the current state is allowed
    ///
    /// # Arguments
    ///
    /// * `allowed_from` - States the current record must be in
    /// * `next` - The record to write
    ///
    /// # Returns
    ///
    /// * `Ok(Ok(()))` - The record was written
    /// * `Ok(Err(current))` - Rejected; `current` is the conflicting status
    fn try_transition(
        &self,
        allowed_from: &[JobState],
        next: &JobStatus,
    ) -> StorageResult<Result<(), JobStatus>>;

    /// Flags the running job `job_id` for cancellation
    ///
    /// Returns false if that job is not the current running job.
    fn request_cancel(&self, job_id: &str) -> StorageResult<bool>;

    /// Returns true if cancellation was requested for `job_id`
    fn cancel_requested(&self, job_id: &str) -> StorageResult<bool>;

    /// Writes an idle status without touching the history log
    fn reset(&self) -> StorageResult<()>;

    /// Returns history records, most recent first
    fn history(&self, limit: usize, offset: usize) -> StorageResult<HistoryPage>;

    /// Removes one history record
    fn delete_history(&self, job_id: &str) -> StorageResult<()>;
}
