//! Processing passes and the triggers that start them.
//!
//! At most one pass runs at a time. A trigger that fires while a pass is
//! active is dropped, not queued. Jobs inside a pass run one after another
//! with `upload_delay` between them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cooldown::CooldownIndex;
use crate::lifecycle;
use crate::orchestrator::{JobOutcome, UploadOrchestrator};
use crate::settings::SettingsProvider;
use crate::store::JobStore;
use crate::{Job, JobStatus, SchedulerError};

/// Result of asking for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running.
    Skipped,
    Ran(PassSummary),
}

/// Tally of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Jobs that were due and past their cooldown at selection time.
    pub selected: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// Which trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Promotes scheduled jobs, then runs a pass.
    Coarse,
    /// Runs a pass.
    Fine,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Coarse => "coarse",
            Trigger::Fine => "fine",
        }
    }
}

/// Releases the single-flight flag when dropped.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Selects due jobs and feeds them to the orchestrator.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    settings: Arc<dyn SettingsProvider>,
    orchestrator: UploadOrchestrator,
    processing: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsProvider>,
        orchestrator: UploadOrchestrator,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            settings,
            orchestrator,
            processing: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Whether a pass is currently running.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Stop the running pass after its current job. Later passes select
    /// nothing; the dispatcher does not restart.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn try_claim(&self) -> Option<PassGuard<'_>> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard {
                flag: &self.processing,
            })
    }

    /// Run one processing pass unless one is already active.
    ///
    /// Store errors abort the pass and are returned; the guard is released
    /// either way. A job deleted mid-execution is skipped, not an error.
    pub async fn run_pass(&self) -> Result<PassOutcome, SchedulerError> {
        let Some(_guard) = self.try_claim() else {
            debug!("processing pass already active, skipping");
            return Ok(PassOutcome::Skipped);
        };

        match self.process_due_jobs().await {
            Ok(summary) => {
                if summary.selected > 0 {
                    info!(
                        selected = summary.selected,
                        completed = summary.completed,
                        retrying = summary.retrying,
                        failed = summary.failed,
                        "processing pass finished"
                    );
                }
                Ok(PassOutcome::Ran(summary))
            }
            Err(e) => {
                error!(error = %e, "processing pass aborted");
                Err(e)
            }
        }
    }

    async fn process_due_jobs(&self) -> Result<PassSummary, SchedulerError> {
        // Settings are read fresh so operators can tune a running engine
        let settings = self.settings.settings().await?;
        let jobs = self.store.list().await?;
        let now = Utc::now();

        let cooldowns = CooldownIndex::build(&jobs, settings.upload_delay());
        let due: Vec<Job> = jobs
            .into_iter()
            .filter(|job| job.is_due(now) && cooldowns.is_eligible(job, now))
            .collect();

        let mut summary = PassSummary {
            selected: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }
        debug!(count = due.len(), "selected due jobs");

        let mut stop_rx = self.stop_tx.subscribe();
        for (i, job) in due.into_iter().enumerate() {
            if i > 0 && !settings.upload_delay().is_zero() {
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop_rx) => {}
                    _ = tokio::time::sleep(settings.upload_delay()) => {}
                }
            }
            if *stop_rx.borrow() {
                info!("stop requested, leaving remaining jobs for the next pass");
                break;
            }

            // The job may have been edited or removed since selection
            let Some(current) = self.store.get(&job.id).await? else {
                debug!(job_id = %job.id, "job removed before execution");
                continue;
            };
            if !current.is_due(Utc::now()) {
                debug!(job_id = %job.id, status = %current.status, "job no longer due");
                continue;
            }

            match self.orchestrator.execute(current, &settings).await {
                Ok(JobOutcome::Completed) => summary.completed += 1,
                Ok(JobOutcome::Retrying { .. }) => summary.retrying += 1,
                Ok(JobOutcome::Failed) => summary.failed += 1,
                // Deleted underneath us; the rest of the pass is unaffected
                Err(SchedulerError::JobNotFound(id)) => {
                    warn!(job_id = %id, "job removed during execution, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Move every `Scheduled` job whose time has come to `Pending`.
    ///
    /// Returns the number of jobs promoted.
    pub async fn promote_scheduled(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let mut promoted = 0;
        for job in self.store.list().await? {
            if job.status != JobStatus::Scheduled || job.scheduled_at.is_some_and(|at| at > now) {
                continue;
            }
            let patch = lifecycle::promote(&job, now)?;
            self.store.update(&job.id, &patch).await?;
            info!(job_id = %job.id, "scheduled job promoted to pending");
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Handle a trigger firing. Errors are logged; triggers have no caller.
    pub async fn fire(&self, trigger: Trigger) {
        if trigger == Trigger::Coarse {
            if let Err(e) = self.promote_scheduled().await {
                error!(error = %e, "failed to promote scheduled jobs");
            }
        }
        if let Ok(PassOutcome::Skipped) = self.run_pass().await {
            debug!(trigger = trigger.as_str(), "trigger skipped");
        }
    }

    /// Spawn the coarse and fine ticker tasks.
    ///
    /// Both exit when `shutdown_rx` flips to true, asking any running pass
    /// to stop first.
    pub fn spawn_triggers(
        self: &Arc<Self>,
        coarse: Duration,
        fine: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            spawn_ticker(Arc::clone(self), Trigger::Coarse, coarse, shutdown_rx.clone()),
            spawn_ticker(Arc::clone(self), Trigger::Fine, fine, shutdown_rx),
        ]
    }
}

/// Resolves once a stop has been requested.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_ticker(
    dispatcher: Arc<Dispatcher>,
    trigger: Trigger,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(trigger = trigger.as_str(), period_secs = period.as_secs(), "trigger started");
        // The first tick completes immediately
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        dispatcher.stop();
                        break;
                    }
                }

                _ = interval.tick() => {
                    dispatcher.fire(trigger).await;
                }
            }
        }

        info!(trigger = trigger.as_str(), "trigger stopped");
    })
}
