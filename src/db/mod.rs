mod migrations;

use std::fmt;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    /// Terminal jobs take no further transitions; only a retry clone
    /// continues their work under a new id.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "Aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum JobKind {
    Download,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "Download",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Download" => Some(Self::Download),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub status: JobStatus,
    pub kind: JobKind,
    pub format: String,
    pub urls: Vec<String>,
    pub extra_params: serde_json::Value,
    pub force_generic_extractor: bool,
    pub log: String,
    pub pid: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// A freshly requested download, not yet persisted (id 0 until insert).
    pub fn new_download(
        format: &str,
        urls: Vec<String>,
        extra_params: serde_json::Value,
        force_generic_extractor: bool,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: 0,
            name: urls.join(", "),
            status: JobStatus::Pending,
            kind: JobKind::Download,
            format: format.to_owned(),
            urls,
            extra_params,
            force_generic_extractor,
            log: String::new(),
            pid: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Clone the request parameters of an existing job into a new
    /// Pending one. Execution state (log, pid, status) is not carried.
    pub fn retry_of(source: &Job) -> Self {
        let mut job = Self::new_download(
            &source.format,
            source.urls.clone(),
            source.extra_params.clone(),
            source.force_generic_extractor,
        );
        job.name = source.name.clone();
        job
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let status_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let urls_str: String = row.get(5)?;
    let params_str: String = row.get(6)?;

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        kind: JobKind::parse(&kind_str).unwrap_or(JobKind::Download),
        format: row.get(4)?,
        urls: serde_json::from_str(&urls_str).unwrap_or_default(),
        extra_params: serde_json::from_str(&params_str).unwrap_or(serde_json::json!({})),
        force_generic_extractor: row.get(7)?,
        log: row.get(8)?,
        pid: row.get::<_, i64>(9)? as u32,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const JOB_COLUMNS: &str = "id, name, status, kind, format, urls, extra_params, \
     force_generic_extractor, log, pid, created_at, updated_at";

/// A handle on the jobs database. The daemon holds exactly one writable
/// handle (the dispatcher's); everything else opens read-only handles, so
/// mutation stays single-writer by construction.
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut conn = Connection::open(path)?;
        migrations::run(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn open_readonly(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn insert(&self, job: &Job) -> anyhow::Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO jobs (name, status, kind, format, urls, extra_params, \
             force_generic_extractor, log, pid, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                job.name,
                job.status.as_str(),
                job.kind.as_str(),
                job.format,
                serde_json::to_string(&job.urls)?,
                serde_json::to_string(&job.extra_params)?,
                job.force_generic_extractor,
                job.log,
                job.pid as i64,
                &now,
                &now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Full overwrite. A terminal row is left alone: status never
    /// regresses, even when a worker claims a job that was aborted
    /// while still queued.
    pub fn update(&self, job: &Job) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE jobs SET name = ?1, status = ?2, kind = ?3, format = ?4, urls = ?5, \
             extra_params = ?6, force_generic_extractor = ?7, log = ?8, pid = ?9, \
             updated_at = ?10 WHERE id = ?11 \
             AND status NOT IN ('Completed', 'Failed', 'Aborted')",
            rusqlite::params![
                job.name,
                job.status.as_str(),
                job.kind.as_str(),
                job.format,
                serde_json::to_string(&job.urls)?,
                serde_json::to_string(&job.extra_params)?,
                job.force_generic_extractor,
                job.log,
                job.pid as i64,
                &now,
                job.id,
            ],
        )?;
        if rows == 0 {
            tracing::debug!(id = job.id, "update against missing job, skipped");
        }
        Ok(())
    }

    // The narrow setters tolerate stale ids: a late action racing a delete
    // is a no-op, not an error.

    pub fn set_status(&self, id: i64, status: JobStatus) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 \
             AND status NOT IN ('Completed', 'Failed', 'Aborted')",
            rusqlite::params![status.as_str(), &now, id],
        )?;
        if rows == 0 {
            tracing::debug!(id, status = %status, "status change skipped");
        }
        Ok(())
    }

    pub fn set_log(&self, id: i64, log: &str) -> anyhow::Result<()> {
        self.set_column(id, "log", log)
    }

    /// A pid only means anything on a live job; terminal rows keep pid 0.
    pub fn set_pid(&self, id: i64, pid: u32) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE jobs SET pid = ?1, updated_at = ?2 WHERE id = ?3 \
             AND status NOT IN ('Completed', 'Failed', 'Aborted')",
            rusqlite::params![pid as i64, &now, id],
        )?;
        Ok(())
    }

    pub fn set_name(&self, id: i64, name: &str) -> anyhow::Result<()> {
        self.set_column(id, "name", name)
    }

    fn set_column(&self, id: i64, column: &str, value: &str) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let sql = format!("UPDATE jobs SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let rows = self
            .conn
            .execute(&sql, rusqlite::params![value, &now, id])?;
        if rows == 0 {
            tracing::debug!(id, column, "write against missing job, skipped");
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                rusqlite::params![id],
                row_to_job,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(job)
    }

    /// Newest first. When `with_logs` is false the log column is replaced
    /// with an empty string so list views don't ship whole logs.
    pub fn list(
        &self,
        limit: usize,
        status: Option<JobStatus>,
        with_logs: bool,
    ) -> anyhow::Result<Vec<Job>> {
        let log_col = if with_logs { "log" } else { "''" };
        let columns = format!(
            "id, name, status, kind, format, urls, extra_params, \
             force_generic_extractor, {log_col}, pid, created_at, updated_at"
        );

        let jobs = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {columns} FROM jobs WHERE status = ?1 ORDER BY id DESC LIMIT ?2"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                stmt.query_map(
                    rusqlite::params![status.as_str(), limit as i64],
                    row_to_job,
                )?
                .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("SELECT {columns} FROM jobs ORDER BY id DESC LIMIT ?1");
                let mut stmt = self.conn.prepare(&sql)?;
                stmt.query_map(rusqlite::params![limit as i64], row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(jobs)
    }

    /// Jobs a previous run left unfinished, oldest first so resubmission
    /// preserves the original ordering.
    pub fn resumable(&self) -> anyhow::Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('Pending', 'Running') ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn count_by_status(&self, status: JobStatus) -> anyhow::Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            rusqlite::params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete only if no live process owns the job: anything except
    /// Running with a recorded pid.
    pub fn delete_safe(&self, id: i64) -> anyhow::Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND NOT (status = 'Running' AND pid <> 0)",
            rusqlite::params![id],
        )?;
        Ok(rows > 0)
    }

    pub fn delete_force(&self, id: i64) -> anyhow::Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])?;
        Ok(rows > 0)
    }

    /// Drop terminal jobs older than the newest `keep` rows. Returns
    /// whether anything was removed so the caller can decide to compact.
    pub fn prune(&self, keep: usize) -> anyhow::Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM jobs WHERE status IN ('Completed', 'Failed', 'Aborted') \
             AND id NOT IN (SELECT id FROM jobs ORDER BY id DESC LIMIT ?1)",
            rusqlite::params![keep as i64],
        )?;
        Ok(rows > 0)
    }

    pub fn purge_terminal(&self) -> anyhow::Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM jobs WHERE status IN ('Completed', 'Failed', 'Aborted')",
            [],
        )?;
        Ok(rows > 0)
    }

    /// Reclaim file space after deletions. Callers run this only when a
    /// delete reported removal; VACUUM holds the write lock.
    pub fn compact(&self) -> anyhow::Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }
}
