//! Services the engine calls out to.
//!
//! The engine owns scheduling; accounts, the automation that actually
//! publishes content, and analytics live behind these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Job;

/// Boxed error from a collaborator.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// An external account jobs are published from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_ref: String,
    #[serde(default)]
    pub name: String,
    /// Accounts marked invalid are never used.
    pub valid: bool,
    /// Opaque credentials handed to the driver.
    #[serde(default)]
    pub credentials: serde_json::Value,
}

/// Looks up accounts by reference.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    /// Return `None` if the account does not exist.
    async fn get_account(&self, account_ref: &str) -> Result<Option<Account>, CollaboratorError>;
}

/// Outcome of one automation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubmitResult {
    pub fn succeeded(url: Option<String>) -> Self {
        Self {
            success: true,
            url,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(error.into()),
        }
    }
}

/// Performs the actual content submission.
///
/// Implementations must be safe to call again for the same job.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn submit(&self, job: &Job, account: &Account) -> Result<SubmitResult, CollaboratorError>;
}

/// Receives attempt events.
///
/// Every call is best-effort: the engine logs errors and carries on.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_attempt_start(&self, job: &Job) -> Result<(), CollaboratorError>;

    async fn record_attempt_success(
        &self,
        job: &Job,
        url: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), CollaboratorError>;

    async fn record_attempt_failure(
        &self,
        job: &Job,
        error: &str,
        duration_ms: u64,
    ) -> Result<(), CollaboratorError>;
}

/// Sink that records attempts as log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl AnalyticsSink for LogSink {
    async fn record_attempt_start(&self, job: &Job) -> Result<(), CollaboratorError> {
        info!(
            job_id = %job.id,
            account = %job.account_ref,
            destination = %job.destination_ref,
            "attempt started"
        );
        Ok(())
    }

    async fn record_attempt_success(
        &self,
        job: &Job,
        url: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), CollaboratorError> {
        info!(job_id = %job.id, url = ?url, duration_ms, "attempt succeeded");
        Ok(())
    }

    async fn record_attempt_failure(
        &self,
        job: &Job,
        error: &str,
        duration_ms: u64,
    ) -> Result<(), CollaboratorError> {
        info!(job_id = %job.id, error = %error, duration_ms, "attempt failed");
        Ok(())
    }
}
