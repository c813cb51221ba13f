//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the StatusStore trait.

use crate::state::{HistoryPage, HistoryRecord, JobState, JobStatus};
use crate::storage::schema::{initialize_schema, HISTORY_LIMIT};
use crate::storage::traits::{StatusStore, StorageError, StorageResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// SQLite status store backend
///
/// The connection sits behind a mutex so one store can be shared by the
/// controller and its job task. Cross-process writers are serialized by
/// SQLite itself.
pub struct SqliteStatusStore {
    conn: Mutex<Connection>,
}

impl SqliteStatusStore {
    /// Opens or creates a status database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStatusStore)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        ",
        )?;
        // The CLI and a running job write from different processes
        conn.busy_timeout(Duration::from_secs(5))?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory store (for testing)
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn read_status(conn: &Connection) -> StorageResult<JobStatus> {
    let row = conn
        .query_row(
            "SELECT record, cancel_requested FROM job_status WHERE slot = 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()?;

    match row {
        Some((record, cancel_requested)) => {
            let mut status: JobStatus = serde_json::from_str(&record)?;
            status.cancelled |= cancel_requested;
            Ok(status)
        }
        None => Ok(JobStatus::idle()),
    }
}

fn write_status(conn: &Connection, status: &JobStatus) -> StorageResult<()> {
    let now = Utc::now();
    let mut record = status.clone();
    record.last_updated = Some(now);

    let json = serde_json::to_string(&record)?;
    let updated_at = now.to_rfc3339();
    let state = record.status.to_db_string();

    // The cancel flag is sticky for one job id and cleared by the next one
    conn.execute(
        "INSERT INTO job_status (slot, job_id, state, cancel_requested, record, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(slot) DO UPDATE SET
             cancel_requested = CASE
                 WHEN job_status.job_id IS excluded.job_id
                 THEN MAX(job_status.cancel_requested, excluded.cancel_requested)
                 ELSE excluded.cancel_requested
             END,
             job_id = excluded.job_id,
             state = excluded.state,
             record = excluded.record,
             updated_at = excluded.updated_at",
        params![record.job_id, state, record.cancelled, json, updated_at],
    )?;

    if let Some(job_id) = &record.job_id {
        conn.execute(
            "INSERT INTO job_history (job_id, state, record, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id) DO UPDATE SET
                 state = excluded.state,
                 record = excluded.record,
                 updated_at = excluded.updated_at",
            params![job_id, state, json, updated_at],
        )?;
        conn.execute(
            "DELETE FROM job_history
             WHERE seq NOT IN (SELECT seq FROM job_history ORDER BY seq DESC LIMIT ?1)",
            params![HISTORY_LIMIT as i64],
        )?;
    }

    Ok(())
}

impl StatusStore for SqliteStatusStore {
    fn load(&self) -> StorageResult<JobStatus> {
        let conn = self.lock()?;
        read_status(&conn)
    }

    fn save(&self, status: &JobStatus) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_status(&tx, status)?;
        tx.commit()?;
        Ok(())
    }

    fn try_transition(
        &self,
        allowed_from: &[JobState],
        next: &JobStatus,
    ) -> StorageResult<Result<(), JobStatus>> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock before the read
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = read_status(&tx)?;
        if !allowed_from.contains(&current.status) {
            return Ok(Err(current));
        }

        write_status(&tx, next)?;
        tx.commit()?;
        Ok(Ok(()))
    }

    fn request_cancel(&self, job_id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE job_status SET cancel_requested = 1
             WHERE slot = 1 AND job_id = ?1 AND state = ?2",
            params![job_id, JobState::Running.to_db_string()],
        )?;
        Ok(changed > 0)
    }

    fn cancel_requested(&self, job_id: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let flag = conn
            .query_row(
                "SELECT cancel_requested FROM job_status WHERE slot = 1 AND job_id = ?1",
                params![job_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    fn reset(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        write_status(&conn, &JobStatus::idle())
    }

    fn history(&self, limit: usize, offset: usize) -> StorageResult<HistoryPage> {
        let conn = self.lock()?;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM job_history", [], |row| row.get(0))?;

        let mut stmt =
            conn.prepare("SELECT record FROM job_history ORDER BY seq DESC LIMIT ?1 OFFSET ?2")?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let now = Utc::now();
        let mut records = Vec::new();
        for row in rows {
            let status: JobStatus = serde_json::from_str(&row?)?;
            records.push(HistoryRecord::from_status(status, now));
        }

        Ok(HistoryPage {
            records,
            total: total as usize,
            limit,
            offset,
        })
    }

    fn delete_history(&self, job_id: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM job_history WHERE job_id = ?1",
            params![job_id],
        )?;
        if deleted == 0 {
            return Err(StorageError::NotFound(job_id.to_string()));
        }
        Ok(())
    }
}
