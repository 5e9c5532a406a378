//! SQLite adapter for JobStore
//!
//! Schema: one row per job. Indexed columns (`status`, `version`,
//! `retain_until`) mirror fields of the JSON `record` column so that listing
//! and compare-and-swap never need to parse JSON.
//!
//! Compare-and-swap runs in an IMMEDIATE transaction and additionally guards
//! the UPDATE with `version = ?`, so it stays atomic when several processes
//! share the database file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::domain::{stamp_write, JobId, JobRecord, JobStats, JobStatus, JobStore, StatusFilter};
use crate::{Result, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id       TEXT PRIMARY KEY,
    status       TEXT NOT NULL,
    version      INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    retain_until TEXT,
    record       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
"#;

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::unavailable(format!("SQLite worker failed: {}", e)))?
    }
}

fn status_clause(filter: StatusFilter) -> (String, Vec<String>) {
    match filter {
        StatusFilter::Any => (String::new(), vec![]),
        StatusFilter::NonTerminal => (
            " WHERE status IN (?1, ?2)".to_string(),
            vec![
                JobStatus::Queued.as_str().to_string(),
                JobStatus::Running.as_str().to_string(),
            ],
        ),
        StatusFilter::Terminal => (
            " WHERE status IN (?1, ?2, ?3)".to_string(),
            vec![
                JobStatus::Completed.as_str().to_string(),
                JobStatus::Failed.as_str().to_string(),
                JobStatus::Cancelled.as_str().to_string(),
            ],
        ),
        StatusFilter::Is(status) => (
            " WHERE status = ?1".to_string(),
            vec![status.as_str().to_string()],
        ),
    }
}

fn decode(json: &str) -> Result<JobRecord> {
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, record: JobRecord) -> Result<()> {
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&record)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO jobs (job_id, status, version, created_at, updated_at, retain_until, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.job_id.to_string(),
                    record.status.as_str(),
                    record.version as i64,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.retain_until.map(|t| t.to_rfc3339()),
                    json,
                ],
            )?;
            if inserted == 0 {
                return Err(StorageError::duplicate_job(record.job_id));
            }
            Ok(())
        })
        .await
    }

    async fn read(&self, job_id: &JobId) -> Result<JobRecord> {
        let job_id = *job_id;
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM jobs WHERE job_id = ?1",
                    params![job_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let record = decode(&json.ok_or_else(|| StorageError::job_not_found(job_id))?)?;
            if !record.is_retained_at(Utc::now()) {
                return Err(StorageError::job_not_found(job_id));
            }
            Ok(record)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        job_id: &JobId,
        expected_version: u64,
        next: JobRecord,
    ) -> Result<JobRecord> {
        let job_id = *job_id;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<(i64, String)> = tx
                .query_row(
                    "SELECT version, record FROM jobs WHERE job_id = ?1",
                    params![job_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (version, json) = current.ok_or_else(|| StorageError::job_not_found(job_id))?;
            if !decode(&json)?.is_retained_at(Utc::now()) {
                return Err(StorageError::job_not_found(job_id));
            }
            if version as u64 != expected_version {
                return Err(StorageError::version_conflict(
                    job_id,
                    expected_version,
                    version as u64,
                ));
            }

            let stored = stamp_write(next, &job_id, expected_version);
            let updated = tx.execute(
                "UPDATE jobs SET status = ?1, version = ?2, updated_at = ?3, retain_until = ?4, record = ?5
                 WHERE job_id = ?6 AND version = ?7",
                params![
                    stored.status.as_str(),
                    stored.version as i64,
                    stored.updated_at.to_rfc3339(),
                    stored.retain_until.map(|t| t.to_rfc3339()),
                    serde_json::to_string(&stored)?,
                    job_id.to_string(),
                    expected_version as i64,
                ],
            )?;
            if updated != 1 {
                return Err(StorageError::version_conflict(
                    job_id,
                    expected_version,
                    version as u64,
                ));
            }
            tx.commit()?;

            debug!(job_id = %job_id, version = stored.version, "job record written");
            Ok(stored)
        })
        .await
    }

    async fn list(&self, filter: StatusFilter) -> Result<Vec<JobId>> {
        self.with_conn(move |conn| {
            let (clause, args) = status_clause(filter);
            let mut stmt =
                conn.prepare(&format!("SELECT job_id FROM jobs{} ORDER BY created_at", clause))?;
            let ids = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.iter().map(|id| id.parse()).collect()
        })
        .await
    }

    async fn scan(&self, filter: StatusFilter) -> Result<Vec<JobRecord>> {
        self.with_conn(move |conn| {
            let (clause, args) = status_clause(filter);
            let mut stmt =
                conn.prepare(&format!("SELECT record FROM jobs{} ORDER BY created_at", clause))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.iter().map(|json| decode(json)).collect()
        })
        .await
    }

    async fn delete(&self, job_id: &JobId) -> Result<bool> {
        let job_id = *job_id;
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn stats(&self) -> Result<JobStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stats = JobStats::default();
            for (status, count) in rows {
                let status: JobStatus = status.parse()?;
                stats.total += count as usize;
                stats.by_status.insert(status, count as usize);
            }
            Ok(stats)
        })
        .await
    }
}
