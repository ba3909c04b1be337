//! The engine facade for embedding applications.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::collaborators::{AccountProvider, AnalyticsSink, AutomationDriver, LogSink};
use crate::cooldown::{self, CooldownIndex};
use crate::dispatcher::{Dispatcher, PassOutcome};
use crate::orchestrator::UploadOrchestrator;
use crate::settings::SettingsProvider;
use crate::store::JobStore;
use crate::{Job, JobPatch, JobView, NewJob, QueueStats, SchedulerError, lifecycle};

/// Upload scheduling and retry engine.
pub struct UploadEngine {
    store: Arc<dyn JobStore>,
    settings: Arc<dyn SettingsProvider>,
    dispatcher: Arc<Dispatcher>,
}

impl UploadEngine {
    /// Build an engine that logs analytics events.
    pub fn new(
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsProvider>,
        accounts: Arc<dyn AccountProvider>,
        driver: Arc<dyn AutomationDriver>,
    ) -> Self {
        Self::with_sink(store, settings, accounts, driver, Arc::new(LogSink))
    }

    pub fn with_sink(
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsProvider>,
        accounts: Arc<dyn AccountProvider>,
        driver: Arc<dyn AutomationDriver>,
        sink: Arc<dyn AnalyticsSink>,
    ) -> Self {
        let orchestrator = UploadOrchestrator::new(Arc::clone(&store), accounts, driver, sink);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            orchestrator,
        ));
        Self {
            store,
            settings,
            dispatcher,
        }
    }

    /// Queue a new job and return its id.
    #[tracing::instrument(
        skip(self, spec),
        fields(account = %spec.account_ref, destination = %spec.destination_ref)
    )]
    pub async fn submit_job(&self, spec: NewJob) -> Result<String, SchedulerError> {
        spec.validate()?;
        let job = Job::from_submission(Uuid::new_v4().to_string(), spec, Utc::now());
        self.store.create(&job).await?;
        info!(job_id = %job.id, status = %job.status, "job submitted");
        Ok(job.id)
    }

    /// All jobs in creation order, each with its cooldown projection.
    pub async fn list_jobs(&self) -> Result<Vec<JobView>, SchedulerError> {
        let settings = self.settings.settings().await?;
        let jobs = self.store.list().await?;
        Ok(cooldown::annotate(jobs, settings.upload_delay(), Utc::now()))
    }

    pub async fn get_job(&self, id: &str) -> Result<JobView, SchedulerError> {
        let settings = self.settings.settings().await?;
        let jobs = self.store.list().await?;
        let index = CooldownIndex::build(&jobs, settings.upload_delay());
        let job = jobs
            .into_iter()
            .find(|job| job.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        let cooldown_remaining_ms = index.remaining_ms(&job, Utc::now());
        Ok(JobView {
            job,
            cooldown_remaining_ms,
        })
    }

    /// Apply an external edit. Jobs held by the dispatcher are rejected.
    pub async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job, SchedulerError> {
        let job = self.require(id).await?;
        lifecycle::check_external_update(&job, patch)?;
        if patch.is_empty() {
            return Ok(job);
        }
        // The dispatcher may claim the job between the check and the write
        let job = self.store.update_idle(id, patch).await?;
        info!(job_id = %id, fields = patch.assignments().len(), "job updated");
        Ok(job)
    }

    /// Delete a job. Jobs held by the dispatcher are rejected.
    pub async fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        let job = self.require(id).await?;
        lifecycle::check_removal(&job)?;
        if !self.store.delete_idle(id).await? {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        }
        info!(job_id = %id, "job removed");
        Ok(())
    }

    /// Return a failed job to `Pending` with a fresh retry budget.
    pub async fn reset_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let job = self.require(id).await?;
        let patch = lifecycle::reset(&job, Utc::now())?;
        let job = self.store.update_idle(id, &patch).await?;
        info!(job_id = %id, "job reset");
        Ok(job)
    }

    /// Run a processing pass now, unless one is already active.
    pub async fn start_processing_pass(&self) -> Result<PassOutcome, SchedulerError> {
        self.dispatcher.run_pass().await
    }

    pub async fn get_stats(&self) -> Result<QueueStats, SchedulerError> {
        let jobs = self.store.list().await?;
        Ok(QueueStats::from_jobs(&jobs))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Spawn the coarse and fine triggers.
    pub fn spawn_triggers(
        &self,
        coarse: Duration,
        fine: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.dispatcher.spawn_triggers(coarse, fine, shutdown_rx)
    }

    async fn require(&self, id: &str) -> Result<Job, SchedulerError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }
}
