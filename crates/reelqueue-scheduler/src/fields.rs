//! Mapping between caller-facing job fields and storage columns.
//!
//! Every field a caller can name has exactly one row in [`FIELD_MAP`], and
//! that row is the only place its storage column is spelled. The store
//! validates the table when it opens, and partial updates are expressed as
//! a [`JobPatch`] of typed assignments rather than raw column names.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::{ContentKind, Job, JobStatus, SchedulerError};

/// A single job field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobField {
    Id,
    AccountRef,
    DestinationRef,
    DestinationLabel,
    ContentKind,
    FileRef,
    DisplayName,
    Caption,
    Status,
    ScheduledAt,
    StartedAt,
    CompletedAt,
    AttemptCount,
    NextRetryAt,
    LastError,
    ResultUrl,
    ProcessingLog,
    CreatedAt,
    UpdatedAt,
}

/// One row of the field map.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub field: JobField,
    /// Name used by callers (matches the serialized `Job` field).
    pub name: &'static str,
    /// Column in the `upload_queue` table.
    pub column: &'static str,
    /// Whether external callers may set this field.
    pub writable: bool,
}

const fn map(
    field: JobField,
    name: &'static str,
    column: &'static str,
    writable: bool,
) -> FieldMapping {
    FieldMapping {
        field,
        name,
        column,
        writable,
    }
}

/// The field map, indexed by `JobField as usize`.
pub const FIELD_MAP: [FieldMapping; 19] = [
    map(JobField::Id, "id", "id", false),
    map(JobField::AccountRef, "account_ref", "account_id", true),
    map(JobField::DestinationRef, "destination_ref", "page_id", true),
    map(JobField::DestinationLabel, "destination_label", "page_name", true),
    map(JobField::ContentKind, "content_kind", "upload_type", true),
    map(JobField::FileRef, "file_ref", "video_path", true),
    map(JobField::DisplayName, "display_name", "video_name", true),
    map(JobField::Caption, "caption", "caption", true),
    map(JobField::Status, "status", "status", true),
    map(JobField::ScheduledAt, "scheduled_at", "scheduled_time", true),
    map(JobField::StartedAt, "started_at", "started_at", true),
    map(JobField::CompletedAt, "completed_at", "completed_at", true),
    map(JobField::AttemptCount, "attempt_count", "retry_count", true),
    map(JobField::NextRetryAt, "next_retry_at", "next_retry_at", true),
    map(JobField::LastError, "last_error", "error_message", true),
    map(JobField::ResultUrl, "result_url", "post_url", true),
    map(JobField::ProcessingLog, "processing_log", "processing_log", false),
    map(JobField::CreatedAt, "created_at", "created_at", false),
    map(JobField::UpdatedAt, "updated_at", "updated_at", false),
];

impl JobField {
    pub const ALL: [JobField; 19] = [
        JobField::Id,
        JobField::AccountRef,
        JobField::DestinationRef,
        JobField::DestinationLabel,
        JobField::ContentKind,
        JobField::FileRef,
        JobField::DisplayName,
        JobField::Caption,
        JobField::Status,
        JobField::ScheduledAt,
        JobField::StartedAt,
        JobField::CompletedAt,
        JobField::AttemptCount,
        JobField::NextRetryAt,
        JobField::LastError,
        JobField::ResultUrl,
        JobField::ProcessingLog,
        JobField::CreatedAt,
        JobField::UpdatedAt,
    ];

    pub fn mapping(self) -> &'static FieldMapping {
        &FIELD_MAP[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.mapping().name
    }

    pub fn column(self) -> &'static str {
        self.mapping().column
    }

    /// Look a field up by its caller-facing name.
    pub fn from_name(name: &str) -> Option<JobField> {
        FIELD_MAP.iter().find(|m| m.name == name).map(|m| m.field)
    }

    /// Look a field up by its storage column.
    pub fn from_column(column: &str) -> Option<JobField> {
        FIELD_MAP.iter().find(|m| m.column == column).map(|m| m.field)
    }
}

/// Check that a field map is total and unambiguous.
///
/// Every `JobField` must sit at its own index, and no caller name or
/// column may appear twice.
pub fn validate_field_map(map: &[FieldMapping]) -> Result<(), SchedulerError> {
    if map.len() != JobField::ALL.len() {
        return Err(SchedulerError::InvalidFieldMap(format!(
            "expected {} entries, found {}",
            JobField::ALL.len(),
            map.len()
        )));
    }

    let mut names = HashSet::new();
    let mut columns = HashSet::new();
    for (index, (entry, field)) in map.iter().zip(JobField::ALL).enumerate() {
        if entry.field != field {
            return Err(SchedulerError::InvalidFieldMap(format!(
                "entry {} maps {:?}, expected {:?}",
                index, entry.field, field
            )));
        }
        if !names.insert(entry.name) {
            return Err(SchedulerError::InvalidFieldMap(format!(
                "duplicate field name '{}'",
                entry.name
            )));
        }
        if !columns.insert(entry.column) {
            return Err(SchedulerError::InvalidFieldMap(format!(
                "duplicate column '{}'",
                entry.column
            )));
        }
    }
    Ok(())
}

/// A typed value for one field assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl FieldValue {
    fn opt_text(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }

    fn opt_time(value: Option<DateTime<Utc>>) -> Self {
        value.map(FieldValue::Timestamp).unwrap_or(FieldValue::Null)
    }
}

/// A partial update to a job.
///
/// Setting the same field twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    assignments: Vec<(JobField, FieldValue)>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, field: JobField, value: FieldValue) -> Self {
        self.put(field, value);
        self
    }

    fn put(&mut self, field: JobField, value: FieldValue) {
        self.assignments.retain(|(f, _)| *f != field);
        self.assignments.push((field, value));
    }

    pub fn account_ref(self, value: impl Into<String>) -> Self {
        self.with(JobField::AccountRef, FieldValue::Text(value.into()))
    }

    pub fn destination_ref(self, value: impl Into<String>) -> Self {
        self.with(JobField::DestinationRef, FieldValue::Text(value.into()))
    }

    pub fn destination_label(self, value: impl Into<String>) -> Self {
        self.with(JobField::DestinationLabel, FieldValue::Text(value.into()))
    }

    pub fn caption(self, value: Option<String>) -> Self {
        self.with(JobField::Caption, FieldValue::opt_text(value))
    }

    pub fn status(self, status: JobStatus) -> Self {
        self.with(JobField::Status, FieldValue::Text(status.as_str().to_string()))
    }

    pub fn scheduled_at(self, at: Option<DateTime<Utc>>) -> Self {
        self.with(JobField::ScheduledAt, FieldValue::opt_time(at))
    }

    pub fn started_at(self, at: Option<DateTime<Utc>>) -> Self {
        self.with(JobField::StartedAt, FieldValue::opt_time(at))
    }

    pub fn completed_at(self, at: Option<DateTime<Utc>>) -> Self {
        self.with(JobField::CompletedAt, FieldValue::opt_time(at))
    }

    pub fn attempt_count(self, count: u32) -> Self {
        self.with(JobField::AttemptCount, FieldValue::Integer(i64::from(count)))
    }

    pub fn next_retry_at(self, at: Option<DateTime<Utc>>) -> Self {
        self.with(JobField::NextRetryAt, FieldValue::opt_time(at))
    }

    pub fn last_error(self, error: Option<String>) -> Self {
        self.with(JobField::LastError, FieldValue::opt_text(error))
    }

    pub fn result_url(self, url: Option<String>) -> Self {
        self.with(JobField::ResultUrl, FieldValue::opt_text(url))
    }

    pub fn processing_log(self, log: String) -> Self {
        self.with(JobField::ProcessingLog, FieldValue::Text(log))
    }

    /// Set a field from a caller-facing `name` and raw string value.
    ///
    /// An empty value clears optional fields.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), SchedulerError> {
        let field = JobField::from_name(name)
            .ok_or_else(|| SchedulerError::InvalidInput(format!("unknown field '{}'", name)))?;
        if !field.mapping().writable {
            return Err(SchedulerError::InvalidInput(format!(
                "field '{}' is read-only",
                name
            )));
        }

        let raw = raw.trim();
        let value = match field {
            JobField::AccountRef
            | JobField::DestinationRef
            | JobField::DestinationLabel
            | JobField::FileRef
            | JobField::DisplayName => {
                if raw.is_empty() && field != JobField::DestinationLabel {
                    return Err(SchedulerError::InvalidInput(format!(
                        "field '{}' cannot be empty",
                        name
                    )));
                }
                FieldValue::Text(raw.to_string())
            }
            JobField::Caption | JobField::LastError | JobField::ResultUrl => {
                FieldValue::opt_text((!raw.is_empty()).then(|| raw.to_string()))
            }
            JobField::ContentKind => FieldValue::Text(raw.parse::<ContentKind>()?.as_str().to_string()),
            JobField::Status => FieldValue::Text(raw.parse::<JobStatus>()?.as_str().to_string()),
            JobField::ScheduledAt
            | JobField::StartedAt
            | JobField::CompletedAt
            | JobField::NextRetryAt => {
                if raw.is_empty() {
                    FieldValue::Null
                } else {
                    let at = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                        SchedulerError::InvalidInput(format!(
                            "field '{}' expects an RFC 3339 timestamp: {}",
                            name, e
                        ))
                    })?;
                    FieldValue::Timestamp(at.with_timezone(&Utc))
                }
            }
            JobField::AttemptCount => {
                let count: u32 = raw.parse().map_err(|_| {
                    SchedulerError::InvalidInput(format!(
                        "field '{}' expects a non-negative integer",
                        name
                    ))
                })?;
                FieldValue::Integer(i64::from(count))
            }
            JobField::Id | JobField::ProcessingLog | JobField::CreatedAt | JobField::UpdatedAt => {
                return Err(SchedulerError::InvalidInput(format!(
                    "field '{}' is read-only",
                    name
                )));
            }
        };

        self.put(field, value);
        Ok(())
    }

    pub fn assignments(&self) -> &[(JobField, FieldValue)] {
        &self.assignments
    }

    pub fn get(&self, field: JobField) -> Option<&FieldValue> {
        self.assignments
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v)
    }

    /// The status this patch sets, if any.
    pub fn status_value(&self) -> Option<JobStatus> {
        match self.get(JobField::Status) {
            Some(FieldValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Apply this patch to an in-memory job.
    pub fn apply_to(&self, job: &mut Job) -> Result<(), SchedulerError> {
        for (field, value) in &self.assignments {
            let mismatch = || {
                SchedulerError::InvalidInput(format!(
                    "value {:?} does not fit field '{}'",
                    value,
                    field.name()
                ))
            };
            match (field, value) {
                (JobField::AccountRef, FieldValue::Text(s)) => job.account_ref = s.clone(),
                (JobField::DestinationRef, FieldValue::Text(s)) => job.destination_ref = s.clone(),
                (JobField::DestinationLabel, FieldValue::Text(s)) => {
                    job.destination_label = s.clone()
                }
                (JobField::ContentKind, FieldValue::Text(s)) => job.content_kind = s.parse()?,
                (JobField::FileRef, FieldValue::Text(s)) => job.file_ref = s.clone(),
                (JobField::DisplayName, FieldValue::Text(s)) => job.display_name = s.clone(),
                (JobField::Caption, v) => job.caption = opt_text(v).ok_or_else(mismatch)?,
                (JobField::Status, FieldValue::Text(s)) => job.status = s.parse()?,
                (JobField::ScheduledAt, v) => job.scheduled_at = opt_time(v).ok_or_else(mismatch)?,
                (JobField::StartedAt, v) => job.started_at = opt_time(v).ok_or_else(mismatch)?,
                (JobField::CompletedAt, v) => job.completed_at = opt_time(v).ok_or_else(mismatch)?,
                (JobField::AttemptCount, FieldValue::Integer(n)) => {
                    job.attempt_count = u32::try_from(*n).map_err(|_| mismatch())?
                }
                (JobField::NextRetryAt, v) => {
                    job.next_retry_at = opt_time(v).ok_or_else(mismatch)?
                }
                (JobField::LastError, v) => job.last_error = opt_text(v).ok_or_else(mismatch)?,
                (JobField::ResultUrl, v) => job.result_url = opt_text(v).ok_or_else(mismatch)?,
                (JobField::ProcessingLog, FieldValue::Text(s)) => job.processing_log = s.clone(),
                (JobField::UpdatedAt, FieldValue::Timestamp(at)) => job.updated_at = *at,
                _ => return Err(mismatch()),
            }
        }
        Ok(())
    }
}

/// Read one field of a job as a typed value.
pub fn value_of(job: &Job, field: JobField) -> FieldValue {
    match field {
        JobField::Id => FieldValue::Text(job.id.clone()),
        JobField::AccountRef => FieldValue::Text(job.account_ref.clone()),
        JobField::DestinationRef => FieldValue::Text(job.destination_ref.clone()),
        JobField::DestinationLabel => FieldValue::Text(job.destination_label.clone()),
        JobField::ContentKind => FieldValue::Text(job.content_kind.as_str().to_string()),
        JobField::FileRef => FieldValue::Text(job.file_ref.clone()),
        JobField::DisplayName => FieldValue::Text(job.display_name.clone()),
        JobField::Caption => FieldValue::opt_text(job.caption.clone()),
        JobField::Status => FieldValue::Text(job.status.as_str().to_string()),
        JobField::ScheduledAt => FieldValue::opt_time(job.scheduled_at),
        JobField::StartedAt => FieldValue::opt_time(job.started_at),
        JobField::CompletedAt => FieldValue::opt_time(job.completed_at),
        JobField::AttemptCount => FieldValue::Integer(i64::from(job.attempt_count)),
        JobField::NextRetryAt => FieldValue::opt_time(job.next_retry_at),
        JobField::LastError => FieldValue::opt_text(job.last_error.clone()),
        JobField::ResultUrl => FieldValue::opt_text(job.result_url.clone()),
        JobField::ProcessingLog => FieldValue::Text(job.processing_log.clone()),
        JobField::CreatedAt => FieldValue::Timestamp(job.created_at),
        JobField::UpdatedAt => FieldValue::Timestamp(job.updated_at),
    }
}

fn opt_text(value: &FieldValue) -> Option<Option<String>> {
    match value {
        FieldValue::Text(s) => Some(Some(s.clone())),
        FieldValue::Null => Some(None),
        _ => None,
    }
}

fn opt_time(value: &FieldValue) -> Option<Option<DateTime<Utc>>> {
    match value {
        FieldValue::Timestamp(at) => Some(Some(*at)),
        FieldValue::Null => Some(None),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_job;
    use proptest::prelude::*;

    #[test]
    fn test_field_map_is_valid() {
        validate_field_map(&FIELD_MAP).unwrap();
    }

    #[test]
    fn test_every_field_resolves_both_ways() {
        for field in JobField::ALL {
            assert_eq!(JobField::from_name(field.name()), Some(field));
            assert_eq!(JobField::from_column(field.column()), Some(field));
        }
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let mut broken = FIELD_MAP;
        broken[2].column = broken[1].column;
        assert!(matches!(
            validate_field_map(&broken),
            Err(SchedulerError::InvalidFieldMap(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut broken = FIELD_MAP;
        broken[5].name = "caption";
        assert!(matches!(
            validate_field_map(&broken),
            Err(SchedulerError::InvalidFieldMap(_))
        ));
    }

    #[test]
    fn test_missing_field_rejected() {
        assert!(validate_field_map(&FIELD_MAP[..18]).is_err());

        let mut misordered = FIELD_MAP;
        misordered.swap(3, 4);
        assert!(validate_field_map(&misordered).is_err());
    }

    #[test]
    fn test_set_rejects_read_only_and_unknown() {
        let mut patch = JobPatch::new();
        assert!(patch.set("id", "x").is_err());
        assert!(patch.set("processing_log", "x").is_err());
        assert!(patch.set("created_at", "2026-01-01T00:00:00Z").is_err());
        assert!(patch.set("retry_count", "1").is_err()); // storage name, not caller name
        assert!(patch.is_empty());
    }

    #[test]
    fn test_set_parses_typed_values() {
        let mut patch = JobPatch::new();
        patch.set("caption", "hello world").unwrap();
        patch.set("scheduled_at", "2026-03-01T12:00:00Z").unwrap();
        patch.set("attempt_count", "2").unwrap();
        patch.set("content_kind", "post").unwrap();
        patch.set("last_error", "").unwrap();

        assert_eq!(
            patch.get(JobField::Caption),
            Some(&FieldValue::Text("hello world".to_string()))
        );
        assert!(matches!(
            patch.get(JobField::ScheduledAt),
            Some(FieldValue::Timestamp(_))
        ));
        assert_eq!(patch.get(JobField::AttemptCount), Some(&FieldValue::Integer(2)));
        assert_eq!(patch.get(JobField::LastError), Some(&FieldValue::Null));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut patch = JobPatch::new();
        assert!(patch.set("attempt_count", "-1").is_err());
        assert!(patch.set("scheduled_at", "tomorrow").is_err());
        assert!(patch.set("status", "running").is_err());
        assert!(patch.set("account_ref", "").is_err());
    }

    #[test]
    fn test_last_assignment_wins() {
        let patch = JobPatch::new()
            .status(JobStatus::Retry)
            .status(JobStatus::Failed);
        assert_eq!(patch.assignments().len(), 1);
        assert_eq!(patch.status_value(), Some(JobStatus::Failed));
    }

    #[test]
    fn test_apply_to_updates_job() {
        let mut job = test_job("j1", "acct", "page");
        let now = Utc::now();
        JobPatch::new()
            .status(JobStatus::Retry)
            .attempt_count(2)
            .next_retry_at(Some(now))
            .last_error(Some("boom".to_string()))
            .apply_to(&mut job)
            .unwrap();

        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.next_retry_at, Some(now));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    proptest! {
        // Any writable text field accepts any non-blank value and applies it verbatim
        #[test]
        fn writable_text_fields_roundtrip(value in "[a-zA-Z0-9_-]{1,40}") {
            for name in ["account_ref", "destination_ref", "file_ref", "display_name", "caption"] {
                let mut patch = JobPatch::new();
                patch.set(name, &value).unwrap();
                let mut job = test_job("j", "acct", "page");
                patch.apply_to(&mut job).unwrap();
                let json = serde_json::to_value(&job).unwrap();
                prop_assert_eq!(json[name].as_str(), Some(value.as_str()));
            }
        }
    }
}
