//! Queue types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// A queued upload job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier, assigned at creation.
    pub id: String,
    /// External account the content is submitted from.
    pub account_ref: String,
    /// Destination page/channel the content is submitted to.
    pub destination_ref: String,
    /// Human-readable destination name.
    pub destination_label: String,
    /// Which driver operation handles this job.
    pub content_kind: ContentKind,
    /// Location of the content file, passed through to the driver.
    pub file_ref: String,
    /// Display name of the content.
    pub display_name: String,
    /// Caption to publish with the content.
    pub caption: Option<String>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Earliest time the job may run.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the most recent attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of failed attempts so far.
    pub attempt_count: u32,
    /// The job is not eligible again until this instant passes.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure reason, cleared on success.
    pub last_error: Option<String>,
    /// Locator for the published content.
    pub result_url: Option<String>,
    /// Append-only diagnostic trace. Never used for control decisions.
    pub processing_log: String,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job was last written.
    pub updated_at: DateTime<Utc>,
}

/// Kind of content being submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Short-form vertical video.
    #[default]
    ShortForm,
    /// Regular feed post.
    Post,
}

/// Current status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to run.
    #[default]
    Pending,
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Held by the dispatcher.
    Processing,
    /// Failed, waiting for `next_retry_at`.
    Retry,
    /// Published successfully.
    Completed,
    /// Gave up.
    Failed,
}

/// Submission request for a new job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub account_ref: String,
    pub destination_ref: String,
    #[serde(default)]
    pub destination_label: String,
    #[serde(default)]
    pub content_kind: ContentKind,
    pub file_ref: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A job annotated with its cooldown projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    /// Milliseconds until the job's account/destination pair cools down.
    pub cooldown_remaining_ms: u64,
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub retry: usize,
    pub scheduled: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::ShortForm => "short_form",
            ContentKind::Post => "post",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_form" | "reel" | "short" => Ok(ContentKind::ShortForm),
            "post" | "video" => Ok(ContentKind::Post),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown content kind '{}', expected short_form or post",
                other
            ))),
        }
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Retry => "retry",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal states admit no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// States subject to the cooldown gate.
    pub fn is_awaiting_execution(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Scheduled | JobStatus::Retry
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "scheduled" => Ok(JobStatus::Scheduled),
            "processing" => Ok(JobStatus::Processing),
            "retry" => Ok(JobStatus::Retry),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

impl NewJob {
    /// Reject submissions that could never be executed.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.account_ref.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(
                "account_ref cannot be empty".to_string(),
            ));
        }
        if self.destination_ref.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(
                "destination_ref cannot be empty".to_string(),
            ));
        }
        if self.file_ref.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(
                "file_ref cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Job {
    /// Create a job from a submission.
    ///
    /// The job starts `Scheduled` when `scheduled_at` is in the future,
    /// otherwise `Pending`.
    pub fn from_submission(id: String, spec: NewJob, now: DateTime<Utc>) -> Self {
        let status = match spec.scheduled_at {
            Some(at) if at > now => JobStatus::Scheduled,
            _ => JobStatus::Pending,
        };
        let display_name = if spec.display_name.is_empty() {
            spec.file_ref.clone()
        } else {
            spec.display_name
        };

        let mut job = Self {
            id,
            account_ref: spec.account_ref,
            destination_ref: spec.destination_ref,
            destination_label: spec.destination_label,
            content_kind: spec.content_kind,
            file_ref: spec.file_ref,
            display_name,
            caption: spec.caption,
            status,
            scheduled_at: spec.scheduled_at,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            result_url: None,
            processing_log: String::new(),
            created_at: now,
            updated_at: now,
        };
        let entry = match status {
            JobStatus::Scheduled => format!(
                "Queued, scheduled for {}",
                spec.scheduled_at
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default()
            ),
            _ => "Queued".to_string(),
        };
        job.processing_log = job.log_with(now, &entry);
        job
    }

    /// Check if this job may be picked up by a processing pass.
    ///
    /// Cooldown is evaluated separately; see [`crate::cooldown`].
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !matches!(self.status, JobStatus::Pending | JobStatus::Retry) {
            return false;
        }
        if self.scheduled_at.is_some_and(|at| at > now) {
            return false;
        }
        if self.next_retry_at.is_some_and(|at| at > now) {
            return false;
        }
        true
    }

    /// The most specific activity timestamp: completion, then start, then creation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// Return the processing log with one more line appended.
    pub fn log_with(&self, now: DateTime<Utc>, entry: &str) -> String {
        let line = format!(
            "[{}] {}",
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
            entry
        );
        if self.processing_log.is_empty() {
            line
        } else {
            format!("{}\n{}", self.processing_log, line)
        }
    }
}

impl QueueStats {
    /// Tally jobs by status.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut stats = Self::default();
        for job in jobs {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Scheduled => stats.scheduled += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Retry => stats.retry += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
pub(crate) fn test_job(id: &str, account: &str, destination: &str) -> Job {
    Job::from_submission(
        id.to_string(),
        NewJob {
            account_ref: account.to_string(),
            destination_ref: destination.to_string(),
            destination_label: "Test Page".to_string(),
            content_kind: ContentKind::ShortForm,
            file_ref: "/videos/clip.mp4".to_string(),
            display_name: "clip".to_string(),
            caption: None,
            scheduled_at: None,
        },
        Utc::now() - chrono::Duration::hours(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn submission(scheduled_at: Option<DateTime<Utc>>) -> NewJob {
        NewJob {
            account_ref: "acct".to_string(),
            destination_ref: "page".to_string(),
            file_ref: "/videos/a.mp4".to_string(),
            scheduled_at,
            ..Default::default()
        }
    }

    // === Unit Tests ===

    #[test]
    fn test_submission_without_schedule_is_pending() {
        let now = Utc::now();
        let job = Job::from_submission("j1".to_string(), submission(None), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.display_name, "/videos/a.mp4");
        assert!(job.processing_log.ends_with("Queued"));
    }

    #[test]
    fn test_submission_with_future_schedule_is_scheduled() {
        let now = Utc::now();
        let at = now + Duration::hours(1);
        let job = Job::from_submission("j1".to_string(), submission(Some(at)), now);

        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.scheduled_at, Some(at));
        assert!(!job.is_due(now));
    }

    #[test]
    fn test_submission_with_past_schedule_is_pending() {
        let now = Utc::now();
        let at = now - Duration::minutes(5);
        let job = Job::from_submission("j1".to_string(), submission(Some(at)), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.is_due(now));
    }

    #[test]
    fn test_retry_job_not_due_before_next_retry() {
        let now = Utc::now();
        let mut job = test_job("j1", "acct", "page");
        job.status = JobStatus::Retry;
        job.next_retry_at = Some(now + Duration::seconds(30));
        assert!(!job.is_due(now));

        job.next_retry_at = Some(now - Duration::seconds(1));
        assert!(job.is_due(now));
    }

    #[test]
    fn test_last_activity_prefers_completion() {
        let mut job = test_job("j1", "acct", "page");
        let started = job.created_at + Duration::minutes(1);
        let completed = job.created_at + Duration::minutes(2);

        assert_eq!(job.last_activity(), job.created_at);
        job.started_at = Some(started);
        assert_eq!(job.last_activity(), started);
        job.completed_at = Some(completed);
        assert_eq!(job.last_activity(), completed);
    }

    #[test]
    fn test_log_with_appends_lines() {
        let now = Utc::now();
        let job = test_job("j1", "acct", "page");
        let log = job.log_with(now, "Processing started");
        let lines: Vec<&str> = log.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("Processing started"));
    }

    #[test]
    fn test_validate_rejects_blank_refs() {
        let mut spec = submission(None);
        assert!(spec.validate().is_ok());

        spec.account_ref = "  ".to_string();
        assert!(matches!(
            spec.validate(),
            Err(SchedulerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Scheduled,
            JobStatus::Processing,
            JobStatus::Retry,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_queue_stats_counts_each_status() {
        let mut jobs = vec![
            test_job("a", "acct", "page"),
            test_job("b", "acct", "page"),
            test_job("c", "acct", "page"),
        ];
        jobs[1].status = JobStatus::Failed;
        jobs[2].status = JobStatus::Retry;

        let stats = QueueStats::from_jobs(&jobs);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retry, 1);
        assert_eq!(stats.completed, 0);
    }

    // === Property-Based Tests ===

    fn status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Scheduled),
            Just(JobStatus::Processing),
            Just(JobStatus::Retry),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
        ]
    }

    proptest! {
        // Only Pending and Retry jobs are ever due, whatever their timestamps say
        #[test]
        fn only_pending_and_retry_are_due(
            status in status(),
            retry_offset in proptest::option::of(-1000i64..1000),
        ) {
            let now = Utc::now();
            let mut job = test_job("j", "acct", "page");
            job.status = status;
            job.next_retry_at = retry_offset.map(|s| now + Duration::seconds(s));

            if job.is_due(now) {
                prop_assert!(matches!(status, JobStatus::Pending | JobStatus::Retry));
            }
        }

        // A scheduled time in the future always blocks execution
        #[test]
        fn future_schedule_never_due(offset in 1i64..100_000) {
            let now = Utc::now();
            let mut job = test_job("j", "acct", "page");
            job.scheduled_at = Some(now + Duration::seconds(offset));

            prop_assert!(!job.is_due(now));
        }

        // Stats always sum to the total
        #[test]
        fn stats_sum_to_total(statuses in prop::collection::vec(status(), 0..50)) {
            let jobs: Vec<Job> = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let mut job = test_job(&i.to_string(), "acct", "page");
                    job.status = *s;
                    job
                })
                .collect();

            let stats = QueueStats::from_jobs(&jobs);
            let sum = stats.pending + stats.scheduled + stats.processing
                + stats.retry + stats.completed + stats.failed;
            prop_assert_eq!(sum, stats.total);
            prop_assert_eq!(stats.total, jobs.len());
        }
    }
}
