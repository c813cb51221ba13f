//! Database schema definitions
//!
//! This module contains the SQL schema for the job status database.

/// Number of job snapshots kept in the history log
pub const HISTORY_LIMIT: usize = 50;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Current job status; a single row, always overwritten whole
CREATE TABLE IF NOT EXISTS job_status (
    slot INTEGER PRIMARY KEY CHECK (slot = 1),
    job_id TEXT,
    state TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Snapshots of recent jobs, most recent = highest seq
CREATE TABLE IF NOT EXISTS job_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_history_state ON job_history(state);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
