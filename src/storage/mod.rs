//! Storage module for persisting job status
//!
//! This module handles all database operations for the pipeline, including:
//! - SQLite database initialization and schema management
//! - The single current job status record
//! - The capped history log of job snapshots
//! - Cross-process cancellation requests

mod schema;
mod sqlite;
mod traits;

pub use schema::HISTORY_LIMIT;
pub use sqlite::SqliteStatusStore;
pub use traits::{StatusStore, StorageError, StorageResult};

use std::path::Path;

/// Initializes or opens a status store
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStatusStore)` - Successfully initialized store
/// * `Err(StorageError)` - Failed to initialize store
pub fn open_store(path: &Path) -> StorageResult<SqliteStatusStore> {
    SqliteStatusStore::new(path)
}
