//! Automation driver that runs an external program per job.
//!
//! The program receives `{"job": ..., "account": ...}` as JSON on stdin and
//! must print `{"success": bool, "url"?: string, "error"?: string}` on stdout.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use reelqueue_scheduler::{Account, AutomationDriver, CollaboratorError, Job, SubmitResult};

/// Errors from running the automation program.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("automation program not found: {0}")]
    NotFound(String),

    #[error("automation program failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid automation output: {0}")]
    InvalidOutput(String),
}

#[derive(Serialize)]
struct DriverInput<'a> {
    job: &'a Job,
    account: &'a Account,
}

/// Runs `program args...` once per attempt.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    program: String,
    args: Vec<String>,
}

impl CommandDriver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace into program and arguments.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    async fn run(&self, job: &Job, account: &Account) -> Result<SubmitResult, DriverError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, job_id = %job.id, "running automation program");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DriverError::NotFound(self.program.clone())
            } else {
                DriverError::Io(e)
            }
        })?;

        let input = serde_json::to_string(&DriverInput { job, account })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %stderr.trim(),
                "automation program failed"
            );
            let detail = if stderr.trim().is_empty() {
                format!("exit status {}", output.status)
            } else {
                stderr.trim().to_string()
            };
            return Err(DriverError::ExecutionFailed(detail));
        }

        serde_json::from_str(stdout.trim()).map_err(|e| {
            DriverError::InvalidOutput(format!("{} (stdout: {})", e, stdout.trim()))
        })
    }
}

#[async_trait]
impl AutomationDriver for CommandDriver {
    async fn submit(&self, job: &Job, account: &Account) -> Result<SubmitResult, CollaboratorError> {
        Ok(self.run(job, account).await?)
    }
}

/// Driver for operator commands that never run a pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDriver;

#[async_trait]
impl AutomationDriver for NoDriver {
    async fn submit(&self, _job: &Job, _account: &Account) -> Result<SubmitResult, CollaboratorError> {
        Ok(SubmitResult::failed("no automation driver configured"))
    }
}
