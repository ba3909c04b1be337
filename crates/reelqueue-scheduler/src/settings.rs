//! Live-tunable engine settings.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

// Validation limits
const MAX_RETRIES_LIMIT: u32 = 100;
const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000; // 1 day

/// Engine settings, read fresh at the start of every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Spacing between jobs in a pass, and the per-destination cooldown.
    pub upload_delay_ms: u64,
    /// Number of retries before a job is marked failed.
    pub max_retries: u32,
    /// Base unit of the linear retry backoff.
    pub retry_backoff_ms: u64,
    /// Upper bound on a single driver call (0 disables the timeout).
    pub job_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upload_delay_ms: 60_000,
            max_retries: 3,
            retry_backoff_ms: 60_000,
            job_timeout_ms: 600_000,
        }
    }
}

impl Settings {
    /// Setting keys, as stored and as accepted by [`Settings::set`].
    pub const KEYS: [&'static str; 4] = [
        "upload_delay_ms",
        "max_retries",
        "retry_backoff_ms",
        "job_timeout_ms",
    ];

    pub fn upload_delay(&self) -> Duration {
        Duration::from_millis(self.upload_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_ms > 0).then(|| Duration::from_millis(self.job_timeout_ms))
    }

    /// Check every value against its limit.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(SchedulerError::InvalidInput(format!(
                "max_retries must be at most {} (got {})",
                MAX_RETRIES_LIMIT, self.max_retries
            )));
        }
        for (key, value) in [
            ("upload_delay_ms", self.upload_delay_ms),
            ("retry_backoff_ms", self.retry_backoff_ms),
            ("job_timeout_ms", self.job_timeout_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(SchedulerError::InvalidInput(format!(
                    "{} must be at most {} (got {})",
                    key, MAX_DURATION_MS, value
                )));
            }
        }
        Ok(())
    }

    /// Set one value by key, then validate.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), SchedulerError> {
        let parse_u64 = |raw: &str| {
            raw.trim().parse::<u64>().map_err(|_| {
                SchedulerError::InvalidInput(format!(
                    "{} expects a non-negative integer (got '{}')",
                    key, raw
                ))
            })
        };

        let mut next = *self;
        match key {
            "upload_delay_ms" => next.upload_delay_ms = parse_u64(raw)?,
            "retry_backoff_ms" => next.retry_backoff_ms = parse_u64(raw)?,
            "job_timeout_ms" => next.job_timeout_ms = parse_u64(raw)?,
            "max_retries" => {
                next.max_retries = u32::try_from(parse_u64(raw)?).map_err(|_| {
                    SchedulerError::InvalidInput(format!("max_retries out of range: {}", raw))
                })?
            }
            other => {
                return Err(SchedulerError::InvalidInput(format!(
                    "unknown setting '{}', expected one of: {}",
                    other,
                    Self::KEYS.join(", ")
                )));
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Key/value pairs in storage form.
    pub fn entries(&self) -> [(&'static str, String); 4] {
        [
            ("upload_delay_ms", self.upload_delay_ms.to_string()),
            ("max_retries", self.max_retries.to_string()),
            ("retry_backoff_ms", self.retry_backoff_ms.to_string()),
            ("job_timeout_ms", self.job_timeout_ms.to_string()),
        ]
    }
}

/// Source of engine settings.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn settings(&self) -> Result<Settings, SchedulerError>;
}

/// Settings that never change.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSettings(pub Settings);

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn settings(&self) -> Result<Settings, SchedulerError> {
        Ok(self.0)
    }
}
