//! Error types for the upload engine.

use thiserror::Error;

use crate::JobStatus;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// SQLite error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store could not be reached (e.g. its lock was poisoned).
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The job is held by the dispatcher and cannot be mutated.
    #[error("job {0} is currently processing")]
    JobBusy(String),

    /// A lifecycle transition that the state machine does not permit.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: JobStatus, event: String },

    /// Caller input that could not be accepted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The field map between caller names and storage columns is inconsistent.
    #[error("invalid field map: {0}")]
    InvalidFieldMap(String),

    /// A value read back from storage could not be decoded.
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}
