//! SQLite-backed implementation of [`StateStore`].
//!
//! Uses a single `Mutex<Connection>`; records are stored as serialized JSON
//! in one row per job / result.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};

use crate::domain::{Job, JobResult};

use super::{Result, StateStore, StoreError};

/// Idempotent DDL for the state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS results (
    job_id TEXT PRIMARY KEY,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// SQLite-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence or
/// [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        Self::init(conn)
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection lock poisoned".into()))
    }
}

impl StateStore for SqliteStateStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        let record = serde_json::to_string(job).map_err(StoreError::backend)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO jobs (job_id, record, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET
                 record = excluded.record,
                 updated_at = excluded.updated_at",
            rusqlite::params![job.job_id, record, job.updated_at.to_rfc3339()],
        )
        .map_err(StoreError::backend)?;
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Option<Job>> {
        let raw: Option<String> = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT record FROM jobs WHERE job_id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?
        };
        raw.map(|record| decode_job(job_id, &record)).transpose()
    }

    fn save_result(&self, result: &JobResult) -> Result<()> {
        let record = serde_json::to_string(result).map_err(StoreError::backend)?;
        let conn = self.lock_conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO results (job_id, record) VALUES (?1, ?2)",
                rusqlite::params![result.job_id, record],
            )
            .map_err(StoreError::backend)?;
        if inserted == 0 {
            return Err(StoreError::DuplicateResult(result.job_id.clone()));
        }
        Ok(())
    }

    fn load_result(&self, job_id: &str) -> Result<Option<JobResult>> {
        let raw: Option<String> = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT record FROM results WHERE job_id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?
        };
        raw.map(|record| decode_result(job_id, &record)).transpose()
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT job_id, record FROM jobs ORDER BY updated_at DESC")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(StoreError::backend)?;

        let mut jobs = Vec::new();
        for row in rows {
            let (job_id, record) = row.map_err(StoreError::backend)?;
            jobs.push(decode_job(&job_id, &record)?);
        }
        Ok(jobs)
    }
}

fn decode_job(job_id: &str, record: &str) -> Result<Job> {
    let job: Job = serde_json::from_str(record).map_err(|e| StoreError::Corrupt {
        key: format!("job:{job_id}"),
        reason: e.to_string(),
    })?;
    job.validate().map_err(|e| StoreError::Corrupt {
        key: format!("job:{job_id}"),
        reason: e.to_string(),
    })?;
    Ok(job)
}

fn decode_result(job_id: &str, record: &str) -> Result<JobResult> {
    let result: JobResult = serde_json::from_str(record).map_err(|e| StoreError::Corrupt {
        key: format!("result:{job_id}"),
        reason: e.to_string(),
    })?;
    result.validate().map_err(|e| StoreError::Corrupt {
        key: format!("result:{job_id}"),
        reason: e.to_string(),
    })?;
    Ok(result)
}
