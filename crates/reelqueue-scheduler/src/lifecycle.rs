//! Job lifecycle transitions.
//!
//! Every function here is pure: it checks that `job` may take the
//! transition and returns the patch that performs it. Nothing touches the
//! store. Each patch also carries the job's processing log with one line
//! appended.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::retry::{self, RetryDecision};
use crate::{Job, JobPatch, JobStatus, SchedulerError, Settings};

fn invalid(job: &Job, event: &str) -> SchedulerError {
    SchedulerError::InvalidTransition {
        from: job.status,
        event: event.to_string(),
    }
}

/// `Scheduled` → `Pending` once `scheduled_at` has passed.
pub fn promote(job: &Job, now: DateTime<Utc>) -> Result<JobPatch, SchedulerError> {
    if job.status != JobStatus::Scheduled {
        return Err(invalid(job, "promote"));
    }
    if job.scheduled_at.is_some_and(|at| at > now) {
        return Err(invalid(job, "promote before scheduled time"));
    }
    Ok(JobPatch::new()
        .status(JobStatus::Pending)
        .processing_log(job.log_with(now, "Scheduled time reached, pending")))
}

/// `Pending` | `Retry` → `Processing`.
pub fn begin(job: &Job, now: DateTime<Utc>) -> Result<JobPatch, SchedulerError> {
    if !matches!(job.status, JobStatus::Pending | JobStatus::Retry) {
        return Err(invalid(job, "begin"));
    }
    let entry = format!("Attempt {} started", job.attempt_count + 1);
    Ok(JobPatch::new()
        .status(JobStatus::Processing)
        .started_at(Some(now))
        .processing_log(job.log_with(now, &entry)))
}

/// `Processing` → `Completed`.
pub fn complete(
    job: &Job,
    url: Option<String>,
    now: DateTime<Utc>,
) -> Result<JobPatch, SchedulerError> {
    if job.status != JobStatus::Processing {
        return Err(invalid(job, "complete"));
    }
    let entry = match &url {
        Some(url) => format!("Completed: {}", url),
        None => "Completed".to_string(),
    };
    Ok(JobPatch::new()
        .status(JobStatus::Completed)
        .completed_at(Some(now))
        .result_url(url)
        .last_error(None)
        .next_retry_at(None)
        .processing_log(job.log_with(now, &entry)))
}

/// `Processing` → `Retry` or `Failed`, as the retry policy decides.
///
/// The attempt count never ends above `max_retries`.
pub fn fail(
    job: &Job,
    error: &str,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<(JobPatch, RetryDecision), SchedulerError> {
    if job.status != JobStatus::Processing {
        return Err(invalid(job, "fail"));
    }

    let attempt = job.attempt_count.saturating_add(1);
    let decision = retry::decide(attempt, settings.max_retries, settings.retry_backoff());
    let patch = match decision {
        RetryDecision::Retry(delay) => {
            let next = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let entry = format!(
                "Attempt {} failed: {}; retrying at {}",
                attempt,
                error,
                next.to_rfc3339_opts(SecondsFormat::Secs, true)
            );
            JobPatch::new()
                .status(JobStatus::Retry)
                .attempt_count(attempt)
                .last_error(Some(error.to_string()))
                .next_retry_at(Some(next))
                .processing_log(job.log_with(now, &entry))
        }
        RetryDecision::Terminal => {
            let entry = format!("Attempt {} failed: {}; giving up", attempt, error);
            failed_patch(job, attempt.min(settings.max_retries), error, now, &entry)
        }
    };
    Ok((patch, decision))
}

/// `Processing` → `Failed` without consulting the retry policy.
///
/// Used for failures that retrying cannot fix, like a missing account.
pub fn fail_terminal(
    job: &Job,
    error: &str,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<JobPatch, SchedulerError> {
    if job.status != JobStatus::Processing {
        return Err(invalid(job, "fail"));
    }
    let attempt = job
        .attempt_count
        .saturating_add(1)
        .min(settings.max_retries);
    let entry = format!("Failed without retry: {}", error);
    Ok(failed_patch(job, attempt, error, now, &entry))
}

fn failed_patch(job: &Job, attempt: u32, error: &str, now: DateTime<Utc>, entry: &str) -> JobPatch {
    JobPatch::new()
        .status(JobStatus::Failed)
        .attempt_count(attempt)
        .last_error(Some(error.to_string()))
        .next_retry_at(None)
        .completed_at(Some(now))
        .processing_log(job.log_with(now, entry))
}

/// Check that an external caller may apply `patch` to `job`.
///
/// Jobs held by the dispatcher cannot be touched, and only the dispatcher
/// may move a job into `Processing`.
pub fn check_external_update(job: &Job, patch: &JobPatch) -> Result<(), SchedulerError> {
    if job.status == JobStatus::Processing {
        return Err(SchedulerError::JobBusy(job.id.clone()));
    }
    if patch.status_value() == Some(JobStatus::Processing) {
        return Err(invalid(job, "external update to processing"));
    }
    Ok(())
}

/// Check that an external caller may delete `job`.
pub fn check_removal(job: &Job) -> Result<(), SchedulerError> {
    if job.status == JobStatus::Processing {
        return Err(SchedulerError::JobBusy(job.id.clone()));
    }
    Ok(())
}

/// `Failed` → `Pending` with a fresh retry budget.
pub fn reset(job: &Job, now: DateTime<Utc>) -> Result<JobPatch, SchedulerError> {
    match job.status {
        JobStatus::Failed => {}
        JobStatus::Processing => return Err(SchedulerError::JobBusy(job.id.clone())),
        _ => return Err(invalid(job, "reset")),
    }
    Ok(JobPatch::new()
        .status(JobStatus::Pending)
        .attempt_count(0)
        .last_error(None)
        .next_retry_at(None)
        .completed_at(None)
        .processing_log(job.log_with(now, "Reset to pending")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_job;
    use std::time::Duration;

    fn applied(job: &Job, patch: &JobPatch) -> Job {
        let mut next = job.clone();
        patch.apply_to(&mut next).unwrap();
        next
    }

    fn processing(id: &str) -> Job {
        let now = Utc::now();
        let job = test_job(id, "acct", "page");
        applied(&job, &begin(&job, now).unwrap())
    }

    fn settings(max_retries: u32) -> Settings {
        Settings {
            max_retries,
            retry_backoff_ms: 60_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_promote_requires_scheduled() {
        let now = Utc::now();
        let mut job = test_job("a", "acct", "page");
        assert!(promote(&job, now).is_err());

        job.status = JobStatus::Scheduled;
        job.scheduled_at = Some(now - chrono::Duration::seconds(1));
        let promoted = applied(&job, &promote(&job, now).unwrap());
        assert_eq!(promoted.status, JobStatus::Pending);
        assert_eq!(promoted.attempt_count, 0);
    }

    #[test]
    fn test_promote_rejects_future_schedule() {
        let now = Utc::now();
        let mut job = test_job("a", "acct", "page");
        job.status = JobStatus::Scheduled;
        job.scheduled_at = Some(now + chrono::Duration::minutes(5));
        assert!(matches!(
            promote(&job, now),
            Err(SchedulerError::InvalidTransition { from: JobStatus::Scheduled, .. })
        ));
    }

    #[test]
    fn test_begin_sets_started_at() {
        let now = Utc::now();
        let job = test_job("a", "acct", "page");
        let started = applied(&job, &begin(&job, now).unwrap());
        assert_eq!(started.status, JobStatus::Processing);
        assert_eq!(started.started_at, Some(now));
        assert!(started.processing_log.ends_with("Attempt 1 started"));
    }

    #[test]
    fn test_begin_rejects_terminal_and_scheduled() {
        let now = Utc::now();
        for status in [
            JobStatus::Scheduled,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let mut job = test_job("a", "acct", "page");
            job.status = status;
            assert!(begin(&job, now).is_err(), "begin allowed from {}", status);
        }
    }

    #[test]
    fn test_complete_clears_error() {
        let now = Utc::now();
        let mut job = processing("a");
        job.last_error = Some("earlier".to_string());
        job.next_retry_at = Some(now);

        let done = applied(
            &job,
            &complete(&job, Some("https://example.com/p/1".to_string()), now).unwrap(),
        );
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.completed_at, Some(now));
        assert_eq!(done.result_url.as_deref(), Some("https://example.com/p/1"));
        assert_eq!(done.last_error, None);
        assert_eq!(done.next_retry_at, None);
    }

    #[test]
    fn test_fail_schedules_retry() {
        let now = Utc::now();
        let job = processing("a");

        let (patch, decision) = fail(&job, "network error", &settings(3), now).unwrap();
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(60)));

        let retrying = applied(&job, &patch);
        assert_eq!(retrying.status, JobStatus::Retry);
        assert_eq!(retrying.attempt_count, 1);
        assert_eq!(retrying.last_error.as_deref(), Some("network error"));
        assert_eq!(
            retrying.next_retry_at,
            Some(now + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_fail_past_budget_is_terminal_and_clamped() {
        let now = Utc::now();
        let mut job = processing("a");
        job.attempt_count = 3;

        let (patch, decision) = fail(&job, "network error", &settings(3), now).unwrap();
        assert_eq!(decision, RetryDecision::Terminal);

        let failed = applied(&job, &patch);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt_count, 3);
        assert_eq!(failed.next_retry_at, None);
        assert_eq!(failed.completed_at, Some(now));
    }

    #[test]
    fn test_fail_terminal_skips_policy() {
        let now = Utc::now();
        let job = processing("a");

        let failed = applied(
            &job,
            &fail_terminal(&job, "account not found", &settings(3), now).unwrap(),
        );
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("account not found"));
    }

    #[test]
    fn test_fail_terminal_respects_zero_budget() {
        let now = Utc::now();
        let job = processing("a");
        let failed = applied(&job, &fail_terminal(&job, "gone", &settings(0), now).unwrap());
        assert_eq!(failed.attempt_count, 0);
    }

    #[test]
    fn test_external_update_rules() {
        let job = test_job("a", "acct", "page");
        assert!(check_external_update(&job, &JobPatch::new().caption(None)).is_ok());
        assert!(check_external_update(&job, &JobPatch::new().status(JobStatus::Processing)).is_err());

        let busy = processing("b");
        assert!(matches!(
            check_external_update(&busy, &JobPatch::new().caption(None)),
            Err(SchedulerError::JobBusy(id)) if id == "b"
        ));
        assert!(matches!(check_removal(&busy), Err(SchedulerError::JobBusy(_))));
    }

    #[test]
    fn test_terminal_jobs_accept_manual_override() {
        let mut job = test_job("a", "acct", "page");
        job.status = JobStatus::Completed;
        assert!(check_external_update(&job, &JobPatch::new().status(JobStatus::Pending)).is_ok());
        assert!(check_removal(&job).is_ok());
    }

    #[test]
    fn test_reset_only_from_failed() {
        let now = Utc::now();
        let mut job = test_job("a", "acct", "page");
        assert!(matches!(
            reset(&job, now),
            Err(SchedulerError::InvalidTransition { .. })
        ));

        job.status = JobStatus::Failed;
        job.attempt_count = 3;
        job.last_error = Some("boom".to_string());
        job.completed_at = Some(now);
        let fresh = applied(&job, &reset(&job, now).unwrap());
        assert_eq!(fresh.status, JobStatus::Pending);
        assert_eq!(fresh.attempt_count, 0);
        assert_eq!(fresh.last_error, None);
        assert_eq!(fresh.completed_at, None);

        let busy = processing("b");
        assert!(matches!(reset(&busy, now), Err(SchedulerError::JobBusy(_))));
    }
}
