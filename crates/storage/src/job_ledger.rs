use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use shared::domain::{Job, JobStatus, SessionId};
use sqlx::{sqlite::SqliteRow, Row};

use crate::Storage;

/// Presence-only ledger of long-running operations for one coordinator run.
///
/// The only constructor is [`JobLedger::open`], which deletes every row left
/// behind by earlier sessions before handing out the ledger. Rows from a crashed
/// run are therefore treated as dead, never as finished, and no job can be
/// registered until that purge has completed.
#[derive(Clone)]
pub struct JobLedger {
    storage: Storage,
    session: SessionId,
    purged_on_open: u64,
}

impl JobLedger {
    pub async fn open(storage: Storage, session: SessionId) -> Result<Self> {
        let purged_on_open = storage.purge_stale_jobs(&session).await?;
        Ok(Self {
            storage,
            session,
            purged_on_open,
        })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Rows from earlier sessions removed when this ledger was opened.
    pub fn purged_on_open(&self) -> u64 {
        self.purged_on_open
    }

    /// Marks an operation as in flight. Registering an existing key again
    /// updates its status and keeps a single row.
    pub async fn register(
        &self,
        session: &SessionId,
        name: &str,
        detail: &str,
        status: JobStatus,
    ) -> Result<Job> {
        self.ensure_current(session)?;
        if name.trim().is_empty() {
            bail!("job name must not be empty");
        }
        self.storage.upsert_job(session, name, detail, status).await
    }

    /// Registers the operation only if no row exists for the key yet.
    /// Returns `None` when it is already in flight; the check and the insert
    /// are a single statement, so concurrent callers cannot both win.
    pub async fn claim(
        &self,
        session: &SessionId,
        name: &str,
        detail: &str,
        status: JobStatus,
    ) -> Result<Option<Job>> {
        self.ensure_current(session)?;
        if name.trim().is_empty() {
            bail!("job name must not be empty");
        }
        self.storage
            .insert_job_if_absent(session, name, detail, status)
            .await
    }

    /// Removes the row; returns whether one existed.
    pub async fn complete(&self, session: &SessionId, name: &str, detail: &str) -> Result<bool> {
        self.ensure_current(session)?;
        self.storage.delete_job(session, name, detail).await
    }

    pub async fn is_active(&self, session: &SessionId, name: &str, detail: &str) -> Result<bool> {
        self.storage.job_exists(session, name, detail).await
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>> {
        self.storage.list_jobs(Some(&self.session)).await
    }

    fn ensure_current(&self, session: &SessionId) -> Result<()> {
        if session != &self.session {
            bail!(
                "job ledger is bound to session {}; refusing write for session {session}",
                self.session
            );
        }
        Ok(())
    }
}

impl Storage {
    pub(crate) async fn purge_stale_jobs(&self, current: &SessionId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE session_id <> ?")
            .bind(current.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub(crate) async fn upsert_job(
        &self,
        session: &SessionId,
        name: &str,
        detail: &str,
        status: JobStatus,
    ) -> Result<Job> {
        let row = sqlx::query(
            "INSERT INTO jobs (session_id, name, detail, status, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, name, detail) DO UPDATE SET status = excluded.status
             RETURNING session_id, name, detail, status, created_at",
        )
        .bind(session.as_str())
        .bind(name)
        .bind(detail)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    pub(crate) async fn insert_job_if_absent(
        &self,
        session: &SessionId,
        name: &str,
        detail: &str,
        status: JobStatus,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            "INSERT INTO jobs (session_id, name, detail, status, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, name, detail) DO NOTHING
             RETURNING session_id, name, detail, status, created_at",
        )
        .bind(session.as_str())
        .bind(name)
        .bind(detail)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub(crate) async fn delete_job(
        &self,
        session: &SessionId,
        name: &str,
        detail: &str,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE session_id = ? AND name = ? AND detail = ?")
                .bind(session.as_str())
                .bind(name)
                .bind(detail)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn job_exists(
        &self,
        session: &SessionId,
        name: &str,
        detail: &str,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE session_id = ? AND name = ? AND detail = ?)",
        )
        .bind(session.as_str())
        .bind(name)
        .bind(detail)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Read-only listing; `None` includes rows from every session.
    pub async fn list_jobs(&self, session: Option<&SessionId>) -> Result<Vec<Job>> {
        let rows = match session {
            Some(session) => {
                sqlx::query(
                    "SELECT session_id, name, detail, status, created_at
                     FROM jobs
                     WHERE session_id = ?
                     ORDER BY created_at ASC, name ASC, detail ASC",
                )
                .bind(session.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT session_id, name, detail, status, created_at
                     FROM jobs
                     ORDER BY created_at ASC, name ASC, detail ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    Ok(Job {
        session_id: SessionId(row.try_get("session_id")?),
        name: row.try_get("name")?,
        detail: row.try_get("detail")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}
