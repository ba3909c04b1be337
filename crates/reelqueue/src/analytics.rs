//! Analytics sink that POSTs attempt events to an HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use reelqueue_scheduler::{AnalyticsSink, CollaboratorError, Job};

/// Request timeout for event delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One attempt event as sent over the wire.
#[derive(Debug, Serialize)]
struct AttemptEvent<'a> {
    event: &'static str,
    job_id: &'a str,
    account_ref: &'a str,
    destination_ref: &'a str,
    content_kind: &'static str,
    attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> AttemptEvent<'a> {
    fn new(event: &'static str, job: &'a Job) -> Self {
        Self {
            event,
            job_id: &job.id,
            account_ref: &job.account_ref,
            destination_ref: &job.destination_ref,
            content_kind: job.content_kind.as_str(),
            attempt: job.attempt_count,
            duration_ms: None,
            url: None,
            error: None,
        }
    }
}

/// Sends attempt events as JSON to a fixed URL.
pub struct HttpAnalyticsSink {
    http: reqwest::Client,
    url: String,
}

impl HttpAnalyticsSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn send(&self, event: &AttemptEvent<'_>) -> Result<(), CollaboratorError> {
        let response = self.http.post(&self.url).json(event).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("analytics POST failed ({}): {}", status, text).into());
        }

        debug!(event = event.event, job_id = %event.job_id, "analytics event delivered");
        Ok(())
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn record_attempt_start(&self, job: &Job) -> Result<(), CollaboratorError> {
        self.send(&AttemptEvent::new("attempt_started", job)).await
    }

    async fn record_attempt_success(
        &self,
        job: &Job,
        url: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), CollaboratorError> {
        let mut event = AttemptEvent::new("attempt_succeeded", job);
        event.duration_ms = Some(duration_ms);
        event.url = url;
        self.send(&event).await
    }

    async fn record_attempt_failure(
        &self,
        job: &Job,
        error: &str,
        duration_ms: u64,
    ) -> Result<(), CollaboratorError> {
        let mut event = AttemptEvent::new("attempt_failed", job);
        event.duration_ms = Some(duration_ms);
        event.error = Some(error);
        self.send(&event).await
    }
}
