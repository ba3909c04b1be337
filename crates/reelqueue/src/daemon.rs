//! Long-running upload daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Result;
use tokio::sync::watch;
use tracing::{error, info};

use reelqueue_scheduler::{AnalyticsSink, LogSink, SqliteJobStore, UploadEngine};

use crate::accounts::FileAccountProvider;
use crate::analytics::HttpAnalyticsSink;
use crate::driver::CommandDriver;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub accounts_path: PathBuf,
    pub driver_command: String,
    pub analytics_url: Option<String>,
    /// Promote scheduled jobs and run a pass this often.
    pub coarse_interval: Duration,
    /// Run a pass this often.
    pub fine_interval: Duration,
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    if config.coarse_interval.is_zero() || config.fine_interval.is_zero() {
        return Err(miette::miette!("trigger intervals must be at least one second"));
    }

    let driver = CommandDriver::from_command_line(&config.driver_command)
        .ok_or_else(|| miette::miette!("driver command cannot be empty"))?;

    let store = Arc::new(SqliteJobStore::open(&config.db_path).map_err(|e| miette::miette!("{}", e))?);

    // Nothing else is dispatching yet, so anything still processing was interrupted
    store
        .recover_interrupted(Utc::now())
        .map_err(|e| miette::miette!("{}", e))?;

    let sink: Arc<dyn AnalyticsSink> = match &config.analytics_url {
        Some(url) => {
            info!(url = %url, "sending analytics events over HTTP");
            Arc::new(
                HttpAnalyticsSink::new(url.clone())
                    .map_err(|e| miette::miette!("failed to build analytics client: {}", e))?,
            )
        }
        None => Arc::new(LogSink),
    };

    let engine = UploadEngine::with_sink(
        store.clone(),
        store.clone(),
        Arc::new(FileAccountProvider::new(&config.accounts_path)),
        Arc::new(driver),
        sink,
    );

    info!(
        db = %config.db_path.display(),
        accounts = %config.accounts_path.display(),
        coarse_interval_secs = config.coarse_interval.as_secs(),
        fine_interval_secs = config.fine_interval.as_secs(),
        "starting upload daemon"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    // Both triggers fire once immediately; promote first so overdue
    // scheduled jobs make that first pass
    match engine.dispatcher().promote_scheduled().await {
        Ok(0) => {}
        Ok(count) => info!(count, "promoted scheduled jobs"),
        Err(e) => error!(error = %e, "failed to promote scheduled jobs"),
    }

    let handles = engine.spawn_triggers(config.coarse_interval, config.fine_interval, shutdown_rx);
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "trigger task panicked");
        }
    }

    info!("upload daemon shut down gracefully");
    Ok(())
}
