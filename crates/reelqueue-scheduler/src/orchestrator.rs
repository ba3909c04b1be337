//! Runs one job through the automation driver.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::collaborators::{AccountProvider, AnalyticsSink, AutomationDriver, SubmitResult};
use crate::lifecycle;
use crate::retry::RetryDecision;
use crate::store::JobStore;
use crate::{Job, SchedulerError, Settings};

/// Where a job ended up after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { next_retry_at: Option<DateTime<Utc>> },
    Failed,
}

/// How a single attempt went, before it is written back.
enum Attempt {
    Succeeded(Option<String>),
    /// Transient failure, subject to the retry policy.
    Failed(String),
    /// Failure that retrying cannot fix.
    Rejected(String),
}

/// Drives one job from selection to its next resting state.
pub struct UploadOrchestrator {
    store: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountProvider>,
    driver: Arc<dyn AutomationDriver>,
    sink: Arc<dyn AnalyticsSink>,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountProvider>,
        driver: Arc<dyn AutomationDriver>,
        sink: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            store,
            accounts,
            driver,
            sink,
        }
    }

    /// Execute one attempt of `job`.
    ///
    /// Job-level failures are recorded on the job and reported through the
    /// outcome. An `Err` means the store could not be updated.
    #[tracing::instrument(
        skip(self, job, settings),
        fields(job_id = %job.id, attempt = job.attempt_count + 1)
    )]
    pub async fn execute(&self, job: Job, settings: &Settings) -> Result<JobOutcome, SchedulerError> {
        let patch = lifecycle::begin(&job, Utc::now())?;
        let job = self.store.update(&job.id, &patch).await?;
        info!(
            account = %job.account_ref,
            destination = %job.destination_ref,
            kind = %job.content_kind,
            "starting upload"
        );

        if let Err(e) = self.sink.record_attempt_start(&job).await {
            warn!(error = %e, "analytics sink failed to record attempt start");
        }

        let started = Instant::now();
        let attempt = self.attempt(&job, settings).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let now = Utc::now();

        match attempt {
            Attempt::Succeeded(url) => {
                let patch = lifecycle::complete(&job, url.clone(), now)?;
                let job = self.store.update(&job.id, &patch).await?;
                info!(url = ?url, duration_ms, "upload completed");

                if let Err(e) = self
                    .sink
                    .record_attempt_success(&job, url.as_deref(), duration_ms)
                    .await
                {
                    warn!(error = %e, "analytics sink failed to record success");
                }
                Ok(JobOutcome::Completed)
            }
            Attempt::Failed(reason) => {
                let (patch, decision) = lifecycle::fail(&job, &reason, settings, now)?;
                let job = self.store.update(&job.id, &patch).await?;
                let outcome = match decision {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            error = %reason,
                            attempts = job.attempt_count,
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "upload failed, will retry"
                        );
                        JobOutcome::Retrying {
                            next_retry_at: job.next_retry_at,
                        }
                    }
                    RetryDecision::Terminal => {
                        error!(
                            error = %reason,
                            attempts = job.attempt_count,
                            "upload failed, retries exhausted"
                        );
                        JobOutcome::Failed
                    }
                };
                self.notify_failure(&job, &reason, duration_ms).await;
                Ok(outcome)
            }
            Attempt::Rejected(reason) => {
                let patch = lifecycle::fail_terminal(&job, &reason, settings, now)?;
                let job = self.store.update(&job.id, &patch).await?;
                error!(error = %reason, "upload rejected");
                self.notify_failure(&job, &reason, duration_ms).await;
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Resolve the account and call the driver.
    async fn attempt(&self, job: &Job, settings: &Settings) -> Attempt {
        let account = match self.accounts.get_account(&job.account_ref).await {
            Ok(Some(account)) if account.valid => account,
            Ok(Some(_)) => {
                return Attempt::Rejected(format!("account {} is marked invalid", job.account_ref));
            }
            Ok(None) => {
                return Attempt::Rejected(format!("account {} not found", job.account_ref));
            }
            Err(e) => return Attempt::Failed(format!("account lookup failed: {}", e)),
        };

        let call = self.driver.submit(job, &account);
        let result = match settings.job_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Ok(SubmitResult::failed(format!(
                    "automation timed out after {}ms",
                    settings.job_timeout_ms
                ))),
            },
            None => call.await,
        };

        match result {
            Ok(SubmitResult {
                success: true, url, ..
            }) => Attempt::Succeeded(url),
            Ok(SubmitResult { error, .. }) => Attempt::Failed(
                error.unwrap_or_else(|| "automation reported failure".to_string()),
            ),
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    async fn notify_failure(&self, job: &Job, reason: &str, duration_ms: u64) {
        if let Err(e) = self
            .sink
            .record_attempt_failure(job, reason, duration_ms)
            .await
        {
            warn!(error = %e, "analytics sink failed to record failure");
        }
    }
}
