//! Durable job store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Null, ToSqlOutput};
use rusqlite::{Connection, OptionalExtension, ToSql, params, params_from_iter};
use tracing::{info, warn};

use crate::fields::{FIELD_MAP, FieldValue, JobField, JobPatch, validate_field_map, value_of};
use crate::settings::{Settings, SettingsProvider};
use crate::{Job, JobStatus, SchedulerError};

/// Table holding queued jobs.
const JOBS_TABLE: &str = "upload_queue";

/// The job store contract.
///
/// `update` always stamps `updated_at`. The store provides no cross-job
/// locking; callers serialize access to a job themselves.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), SchedulerError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, SchedulerError>;

    /// All jobs in creation order.
    async fn list(&self) -> Result<Vec<Job>, SchedulerError>;

    /// Apply a partial update and return the updated job.
    async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, SchedulerError>;

    /// Delete a job. Returns false if it did not exist.
    async fn delete(&self, id: &str) -> Result<bool, SchedulerError>;

    /// Like `update`, but refuses with `JobBusy` if the job is
    /// `Processing` at the moment of the write.
    async fn update_idle(&self, id: &str, patch: &JobPatch) -> Result<Job, SchedulerError>;

    /// Like `delete`, but refuses with `JobBusy` if the job is
    /// `Processing` at the moment of the write.
    async fn delete_idle(&self, id: &str) -> Result<bool, SchedulerError>;
}

/// SQLite-backed job store.
///
/// Also persists engine [`Settings`] in a key/value table.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

/// A job row as read from the database, before decoding.
struct JobRow {
    id: String,
    account_ref: String,
    destination_ref: String,
    destination_label: String,
    content_kind: String,
    file_ref: String,
    display_name: String,
    caption: Option<String>,
    status: String,
    scheduled_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    attempt_count: i64,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    result_url: Option<String>,
    processing_log: String,
    created_at: String,
    updated_at: String,
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Text(s) => ToSqlOutput::from(s.as_str()),
            FieldValue::Integer(n) => ToSqlOutput::from(*n),
            FieldValue::Timestamp(at) => ToSqlOutput::from(format_time(at)),
            FieldValue::Null => ToSqlOutput::from(Null),
        })
    }
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Column definition for a field.
fn column_type(field: JobField) -> &'static str {
    match field {
        JobField::Id => "TEXT PRIMARY KEY",
        JobField::AttemptCount => "INTEGER NOT NULL DEFAULT 0",
        JobField::Caption
        | JobField::ScheduledAt
        | JobField::StartedAt
        | JobField::CompletedAt
        | JobField::NextRetryAt
        | JobField::LastError
        | JobField::ResultUrl => "TEXT",
        JobField::ProcessingLog | JobField::DestinationLabel => "TEXT NOT NULL DEFAULT ''",
        _ => "TEXT NOT NULL",
    }
}

/// Row filter that leaves jobs held by the dispatcher alone.
fn idle_condition() -> String {
    format!(
        " AND {} != '{}'",
        JobField::Status.column(),
        JobStatus::Processing.as_str()
    )
}

fn select_columns() -> String {
    FIELD_MAP
        .iter()
        .map(|m| m.column)
        .collect::<Vec<_>>()
        .join(", ")
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let col = |field: JobField| field as usize;
        Ok(Self {
            id: row.get(col(JobField::Id))?,
            account_ref: row.get(col(JobField::AccountRef))?,
            destination_ref: row.get(col(JobField::DestinationRef))?,
            destination_label: row.get(col(JobField::DestinationLabel))?,
            content_kind: row.get(col(JobField::ContentKind))?,
            file_ref: row.get(col(JobField::FileRef))?,
            display_name: row.get(col(JobField::DisplayName))?,
            caption: row.get(col(JobField::Caption))?,
            status: row.get(col(JobField::Status))?,
            scheduled_at: row.get(col(JobField::ScheduledAt))?,
            started_at: row.get(col(JobField::StartedAt))?,
            completed_at: row.get(col(JobField::CompletedAt))?,
            attempt_count: row.get(col(JobField::AttemptCount))?,
            next_retry_at: row.get(col(JobField::NextRetryAt))?,
            last_error: row.get(col(JobField::LastError))?,
            result_url: row.get(col(JobField::ResultUrl))?,
            processing_log: row.get(col(JobField::ProcessingLog))?,
            created_at: row.get(col(JobField::CreatedAt))?,
            updated_at: row.get(col(JobField::UpdatedAt))?,
        })
    }

    fn into_job(self) -> Result<Job, SchedulerError> {
        let id = self.id;
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: id.clone(),
            reason,
        };
        let time = |field: JobField, raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("{}: {}", field.column(), e)))
        };
        let opt_time = |field: JobField, raw: Option<String>| {
            raw.as_deref().map(|raw| time(field, raw)).transpose()
        };

        Ok(Job {
            content_kind: self
                .content_kind
                .parse()
                .map_err(|e: SchedulerError| corrupt(e.to_string()))?,
            status: self
                .status
                .parse()
                .map_err(|e: SchedulerError| corrupt(e.to_string()))?,
            attempt_count: u32::try_from(self.attempt_count)
                .map_err(|_| corrupt(format!("attempt count {}", self.attempt_count)))?,
            scheduled_at: opt_time(JobField::ScheduledAt, self.scheduled_at)?,
            started_at: opt_time(JobField::StartedAt, self.started_at)?,
            completed_at: opt_time(JobField::CompletedAt, self.completed_at)?,
            next_retry_at: opt_time(JobField::NextRetryAt, self.next_retry_at)?,
            created_at: time(JobField::CreatedAt, &self.created_at)?,
            updated_at: time(JobField::UpdatedAt, &self.updated_at)?,
            account_ref: self.account_ref,
            destination_ref: self.destination_ref,
            destination_label: self.destination_label,
            file_ref: self.file_ref,
            display_name: self.display_name,
            caption: self.caption,
            last_error: self.last_error,
            result_url: self.result_url,
            processing_log: self.processing_log,
            id: id.clone(),
        })
    }
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::init(conn)?;
        info!(path = %path.display(), "job database initialized");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SchedulerError> {
        validate_field_map(&FIELD_MAP)?;

        let columns = FIELD_MAP
            .iter()
            .map(|m| format!("{} {}", m.column, column_type(m.field)))
            .collect::<Vec<_>>()
            .join(",\n                ");
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                {columns}
            );
            CREATE INDEX IF NOT EXISTS idx_queue_partition ON {table}({account}, {destination});
            CREATE INDEX IF NOT EXISTS idx_queue_status ON {table}({status});

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
            table = JOBS_TABLE,
            columns = columns,
            account = JobField::AccountRef.column(),
            destination = JobField::DestinationRef.column(),
            status = JobField::Status.column(),
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SchedulerError> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("connection lock poisoned".to_string()))
    }

    /// Move jobs stranded in `processing` to `retry`, due immediately.
    ///
    /// Only call this before any dispatcher is running against the
    /// database; a live pass holds its job in `processing`.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let stranded: Vec<Job> = self
            .list_sync()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Processing)
            .collect();

        for job in &stranded {
            let patch = JobPatch::new()
                .status(JobStatus::Retry)
                .next_retry_at(Some(now))
                .processing_log(job.log_with(now, "Recovered after interrupted run"));
            self.update_sync(&job.id, &patch, now, false)?;
        }

        if !stranded.is_empty() {
            warn!(count = stranded.len(), "recovered interrupted jobs");
        }
        Ok(stranded.len())
    }

    fn get_sync(&self, id: &str) -> Result<Option<Job>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            select_columns(),
            JOBS_TABLE,
            JobField::Id.column()
        ))?;
        let row = stmt.query_row(params![id], JobRow::from_row).optional()?;
        row.map(JobRow::into_job).transpose()
    }

    fn list_sync(&self) -> Result<Vec<Job>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid ASC",
            select_columns(),
            JOBS_TABLE
        ))?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    fn update_sync(
        &self,
        id: &str,
        patch: &JobPatch,
        now: DateTime<Utc>,
        idle_only: bool,
    ) -> Result<Job, SchedulerError> {
        let mut values: Vec<&FieldValue> = Vec::new();
        let mut sets: Vec<String> = Vec::new();
        for (field, value) in patch.assignments() {
            if matches!(field, JobField::Id | JobField::CreatedAt | JobField::UpdatedAt) {
                continue;
            }
            values.push(value);
            sets.push(format!("{} = ?{}", field.column(), values.len()));
        }

        let stamp = FieldValue::Timestamp(now);
        values.push(&stamp);
        sets.push(format!("{} = ?{}", JobField::UpdatedAt.column(), values.len()));

        let id_value = FieldValue::Text(id.to_string());
        values.push(&id_value);
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}{}",
            JOBS_TABLE,
            sets.join(", "),
            JobField::Id.column(),
            values.len(),
            if idle_only { idle_condition() } else { String::new() }
        );

        let changed = {
            let conn = self.conn()?;
            conn.execute(&sql, params_from_iter(values.iter()))?
        };
        if changed == 0 {
            return Err(self.missing_or_busy(id)?);
        }

        self.get_sync(id)?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    fn delete_sync(&self, id: &str, idle_only: bool) -> Result<bool, SchedulerError> {
        let deleted = {
            let conn = self.conn()?;
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1{}",
                    JOBS_TABLE,
                    JobField::Id.column(),
                    if idle_only { idle_condition() } else { String::new() }
                ),
                params![id],
            )?
        };
        if deleted > 0 {
            return Ok(true);
        }
        match self.missing_or_busy(id)? {
            SchedulerError::JobNotFound(_) => Ok(false),
            busy => Err(busy),
        }
    }

    /// Explain why a write matched no row.
    fn missing_or_busy(&self, id: &str) -> Result<SchedulerError, SchedulerError> {
        Ok(match self.get_sync(id)? {
            Some(_) => SchedulerError::JobBusy(id.to_string()),
            None => SchedulerError::JobNotFound(id.to_string()),
        })
    }

    /// Persist all settings.
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), SchedulerError> {
        settings.validate()?;
        let conn = self.conn()?;
        for (key, value) in settings.entries() {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<(), SchedulerError> {
        let values: Vec<FieldValue> = JobField::ALL.iter().map(|f| value_of(job, *f)).collect();
        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                JOBS_TABLE,
                select_columns(),
                placeholders
            ),
            params_from_iter(values.iter()),
        )?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, SchedulerError> {
        self.get_sync(id)
    }

    async fn list(&self) -> Result<Vec<Job>, SchedulerError> {
        self.list_sync()
    }

    async fn update(&self, id: &str, patch: &JobPatch) -> Result<Job, SchedulerError> {
        self.update_sync(id, patch, Utc::now(), false)
    }

    async fn delete(&self, id: &str) -> Result<bool, SchedulerError> {
        self.delete_sync(id, false)
    }

    async fn update_idle(&self, id: &str, patch: &JobPatch) -> Result<Job, SchedulerError> {
        self.update_sync(id, patch, Utc::now(), true)
    }

    async fn delete_idle(&self, id: &str) -> Result<bool, SchedulerError> {
        self.delete_sync(id, true)
    }
}

#[async_trait]
impl SettingsProvider for SqliteJobStore {
    /// Stored settings over defaults. Unknown or invalid rows are skipped.
    async fn settings(&self) -> Result<Settings, SchedulerError> {
        let rows: Vec<(String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut settings = Settings::default();
        for (key, value) in rows {
            if let Err(e) = settings.set(&key, &value) {
                warn!(key = %key, value = %value, error = %e, "ignoring stored setting");
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_job;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut job = test_job("j1", "acct", "page");
        job.caption = Some("caption text".to_string());
        job.scheduled_at = Some(job.created_at + Duration::minutes(5));

        store.create(&job).await.unwrap();
        let loaded = store.get("j1").await.unwrap().unwrap();

        assert_eq!(loaded, job);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_preserves_creation_order() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        for id in ["c", "a", "b"] {
            store.create(&test_job(id, "acct", "page")).await.unwrap();
        }

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_update_applies_patch_and_stamps() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = test_job("j1", "acct", "page");
        store.create(&job).await.unwrap();

        let patch = JobPatch::new()
            .status(JobStatus::Retry)
            .attempt_count(1)
            .last_error(Some("network error".to_string()));
        let updated = store.update("j1", &patch).await.unwrap();

        assert_eq!(updated.status, JobStatus::Retry);
        assert_eq!(updated.attempt_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("network error"));
        assert!(updated.updated_at > job.updated_at);
        assert_eq!(updated.created_at, job.created_at);
    }

    #[tokio::test]
    async fn test_update_missing_job_errors() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let result = store
            .update("missing", &JobPatch::new().status(JobStatus::Failed))
            .await;
        assert!(matches!(result, Err(SchedulerError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_can_clear_optional_fields() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut job = test_job("j1", "acct", "page");
        job.last_error = Some("old".to_string());
        job.next_retry_at = Some(Utc::now());
        store.create(&job).await.unwrap();

        let updated = store
            .update("j1", &JobPatch::new().last_error(None).next_retry_at(None))
            .await
            .unwrap();
        assert!(updated.last_error.is_none());
        assert!(updated.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.create(&test_job("j1", "acct", "page")).await.unwrap();

        assert!(store.delete("j1").await.unwrap());
        assert!(!store.delete("j1").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_writes_leave_processing_jobs_alone() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.create(&test_job("j1", "acct", "page")).await.unwrap();
        store
            .update("j1", &JobPatch::new().status(JobStatus::Processing))
            .await
            .unwrap();

        let edit = JobPatch::new().caption(Some("edited".to_string()));
        assert!(matches!(
            store.update_idle("j1", &edit).await,
            Err(SchedulerError::JobBusy(_))
        ));
        assert!(matches!(
            store.delete_idle("j1").await,
            Err(SchedulerError::JobBusy(_))
        ));

        let job = store.get("j1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.caption, None);

        // Once the dispatcher lets go, the same writes succeed
        store
            .update("j1", &JobPatch::new().status(JobStatus::Retry))
            .await
            .unwrap();
        let job = store.update_idle("j1", &edit).await.unwrap();
        assert_eq!(job.caption.as_deref(), Some("edited"));
        assert!(store.delete_idle("j1").await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_writes_on_missing_job() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        assert!(matches!(
            store
                .update_idle("missing", &JobPatch::new().caption(None))
                .await,
            Err(SchedulerError::JobNotFound(_))
        ));
        assert!(!store.delete_idle("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = SqliteJobStore::open(&path).unwrap();
            let mut job = test_job("j1", "acct", "page");
            job.status = JobStatus::Processing;
            job.attempt_count = 1;
            store.create(&job).await.unwrap();
            store.create(&test_job("j2", "acct", "page")).await.unwrap();
        }

        let store = SqliteJobStore::open(&path).unwrap();
        // Opening alone leaves the job untouched
        assert_eq!(
            store.get("j1").await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        assert_eq!(store.recover_interrupted(Utc::now()).unwrap(), 1);
        let recovered = store.get("j1").await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Retry);
        assert_eq!(recovered.attempt_count, 1);
        assert!(recovered.next_retry_at.is_some());
        assert!(recovered.processing_log.contains("Recovered after interrupted run"));

        let untouched = store.get("j2").await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_settings_default_then_saved() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        assert_eq!(store.settings().await.unwrap(), Settings::default());

        let tuned = Settings {
            upload_delay_ms: 0,
            max_retries: 5,
            ..Default::default()
        };
        store.save_settings(&tuned).await.unwrap();
        assert_eq!(store.settings().await.unwrap(), tuned);
    }

    #[tokio::test]
    async fn test_corrupt_status_is_reported() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.create(&test_job("j1", "acct", "page")).await.unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                &format!("UPDATE {} SET status = 'exploded'", JOBS_TABLE),
                [],
            )
            .unwrap();
        }

        assert!(matches!(
            store.get("j1").await,
            Err(SchedulerError::CorruptRecord { .. })
        ));
    }
}
