//! Upload scheduling and retry engine for reelqueue.
//!
//! This crate provides:
//! - A durable SQLite job store with a validated field map
//! - Per-destination cooldowns and a linear retry policy
//! - A single-flight dispatcher driven by coarse and fine triggers
//! - An orchestrator that runs each job through an external automation driver

mod collaborators;
pub mod cooldown;
mod dispatcher;
mod engine;
mod error;
pub mod fields;
pub mod lifecycle;
mod orchestrator;
pub mod retry;
mod settings;
mod store;
mod types;

pub use collaborators::{
    Account, AccountProvider, AnalyticsSink, AutomationDriver, CollaboratorError, LogSink,
    SubmitResult,
};
pub use dispatcher::{Dispatcher, PassOutcome, PassSummary, Trigger};
pub use engine::UploadEngine;
pub use error::SchedulerError;
pub use fields::{FIELD_MAP, FieldMapping, FieldValue, JobField, JobPatch};
pub use orchestrator::{JobOutcome, UploadOrchestrator};
pub use retry::RetryDecision;
pub use settings::{Settings, SettingsProvider, StaticSettings};
pub use store::{JobStore, SqliteJobStore};
pub use types::{ContentKind, Job, JobStatus, JobView, NewJob, QueueStats};
