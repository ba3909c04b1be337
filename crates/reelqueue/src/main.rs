//! ReelQueue: scheduled video upload queue
//!
//! Main binary with subcommands:
//! - `daemon`: Trigger loop that promotes scheduled jobs and runs passes
//! - `submit`, `list`, `show`, `update`, `remove`, `reset`: Queue management
//! - `process`: Run a single processing pass
//! - `stats`, `settings`, `accounts`: Operator tooling

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reelqueue_scheduler::{
    AutomationDriver, ContentKind, JobPatch, JobView, NewJob, PassOutcome, SettingsProvider,
    SqliteJobStore, UploadEngine,
};

mod accounts;
mod analytics;
mod daemon;
mod driver;

use accounts::{AccountFile, FileAccountProvider};
use driver::{CommandDriver, NoDriver};

#[derive(Parser)]
#[command(name = "reelqueue")]
#[command(about = "Scheduled video upload queue", long_about = None)]
struct Cli {
    /// Job database path
    #[arg(long, global = true, env = "REELQUEUE_DB")]
    db: Option<PathBuf>,

    /// Account file path
    #[arg(long, global = true, env = "REELQUEUE_ACCOUNTS")]
    accounts: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the upload daemon
    Daemon {
        /// Automation program, run once per attempt
        #[arg(long, env = "REELQUEUE_DRIVER")]
        driver: String,

        /// POST attempt events to this URL instead of logging them
        #[arg(long, env = "REELQUEUE_ANALYTICS_URL")]
        analytics_url: Option<String>,

        /// Promotion interval in seconds
        #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
        coarse_interval: u64,

        /// Pass interval in seconds
        #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
        fine_interval: u64,
    },

    /// Queue a new upload
    Submit {
        /// Account to publish as
        #[arg(long)]
        account: String,

        /// Destination page or channel
        #[arg(long)]
        destination: String,

        /// Human-readable destination name
        #[arg(long, default_value = "")]
        label: String,

        /// Video file to upload
        #[arg(long)]
        file: String,

        /// Content kind (short_form or post)
        #[arg(long, default_value = "short_form")]
        kind: ContentKind,

        /// Display name shown in listings
        #[arg(long, default_value = "")]
        name: String,

        /// Post caption
        #[arg(long)]
        caption: Option<String>,

        /// Publish no earlier than this RFC 3339 time
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// List jobs with their remaining cooldown
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one job, including its processing log
    Show {
        id: String,
    },

    /// Update job fields (field=value, empty value clears)
    Update {
        id: String,

        #[arg(required = true, value_name = "FIELD=VALUE")]
        assignments: Vec<String>,
    },

    /// Remove a job
    Remove {
        id: String,
    },

    /// Requeue a failed job with a fresh retry budget
    Reset {
        id: String,
    },

    /// Run one processing pass now. Do not run alongside the daemon.
    Process {
        /// Automation program, run once per attempt
        #[arg(long, env = "REELQUEUE_DRIVER")]
        driver: String,
    },

    /// Show job counts by status
    Stats,

    /// Show or change engine settings
    Settings {
        #[command(subcommand)]
        command: Option<SettingsCommand>,
    },

    /// Manage the account file
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print all settings
    Show,
    /// Set one setting
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum AccountsCommand {
    /// List accounts
    List,
    /// Add or replace an account
    Add {
        account_ref: String,

        #[arg(long, default_value = "")]
        name: String,

        /// Credentials as JSON, handed to the automation program
        #[arg(long)]
        credentials: Option<String>,
    },
    /// Remove an account
    Remove { account_ref: String },
    /// Mark an account invalid; its jobs fail without retrying
    Invalidate { account_ref: String },
    /// Mark an account valid again
    Validate { account_ref: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "reelqueue=info,reelqueue_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let accounts_path = cli.accounts.unwrap_or_else(AccountFile::default_path);

    match cli.command {
        Commands::Daemon {
            driver,
            analytics_url,
            coarse_interval,
            fine_interval,
        } => {
            ensure_parent(&db_path).await?;
            daemon::run(daemon::DaemonConfig {
                db_path,
                accounts_path,
                driver_command: driver,
                analytics_url,
                coarse_interval: Duration::from_secs(coarse_interval),
                fine_interval: Duration::from_secs(fine_interval),
            })
            .await
        }

        Commands::Submit {
            account,
            destination,
            label,
            file,
            kind,
            name,
            caption,
            at,
        } => {
            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            let id = engine
                .submit_job(NewJob {
                    account_ref: account,
                    destination_ref: destination,
                    destination_label: label,
                    content_kind: kind,
                    file_ref: file,
                    display_name: name,
                    caption,
                    scheduled_at: at,
                })
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{}", id);
            Ok(())
        }

        Commands::List { json } => {
            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            let views = engine
                .list_jobs()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            if json {
                print_json(&views)
            } else {
                print_table(&views);
                Ok(())
            }
        }

        Commands::Show { id } => {
            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            let view = engine
                .get_job(&id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&view)
        }

        Commands::Update { id, assignments } => {
            let mut patch = JobPatch::new();
            for assignment in &assignments {
                let (field, value) = assignment.split_once('=').ok_or_else(|| {
                    miette::miette!("expected FIELD=VALUE, got '{}'", assignment)
                })?;
                patch
                    .set(field.trim(), value)
                    .map_err(|e| miette::miette!("{}", e))?;
            }

            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            let job = engine
                .update_job(&id, &patch)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Remove { id } => {
            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            engine
                .remove_job(&id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("removed {}", id);
            Ok(())
        }

        Commands::Reset { id } => {
            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            let job = engine
                .reset_job(&id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{} is {}", job.id, job.status);
            Ok(())
        }

        Commands::Process { driver } => {
            let driver = CommandDriver::from_command_line(&driver)
                .ok_or_else(|| miette::miette!("driver command cannot be empty"))?;
            let engine = open_engine(&db_path, &accounts_path, Arc::new(driver)).await?;

            let promoted = engine
                .dispatcher()
                .promote_scheduled()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            if promoted > 0 {
                println!("promoted {} scheduled jobs", promoted);
            }

            match engine
                .start_processing_pass()
                .await
                .map_err(|e| miette::miette!("{}", e))?
            {
                PassOutcome::Ran(summary) => print_json(&summary),
                PassOutcome::Skipped => {
                    println!("a pass is already running");
                    Ok(())
                }
            }
        }

        Commands::Stats => {
            let engine = open_engine(&db_path, &accounts_path, Arc::new(NoDriver)).await?;
            let stats = engine
                .get_stats()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&stats)
        }

        Commands::Settings { command } => {
            let store = open_store(&db_path).await?;
            let mut settings = store
                .settings()
                .await
                .map_err(|e| miette::miette!("{}", e))?;

            if let Some(SettingsCommand::Set { key, value }) = command {
                settings
                    .set(&key, &value)
                    .map_err(|e| miette::miette!("{}", e))?;
                store
                    .save_settings(&settings)
                    .await
                    .map_err(|e| miette::miette!("{}", e))?;
            }

            for (key, value) in settings.entries() {
                println!("{} = {}", key, value);
            }
            Ok(())
        }

        Commands::Accounts { command } => run_accounts_command(&accounts_path, command).await,
    }
}

async fn run_accounts_command(path: &Path, command: AccountsCommand) -> Result<()> {
    let mut file = AccountFile::load(path)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    match command {
        AccountsCommand::List => {
            for account in file.list() {
                let state = if account.valid { "valid" } else { "invalid" };
                println!("{}\t{}\t{}", account.account_ref, state, account.name);
            }
        }
        AccountsCommand::Add {
            account_ref,
            name,
            credentials,
        } => {
            let credentials = match credentials {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| miette::miette!("invalid credentials JSON: {}", e))?,
                None => serde_json::Value::Null,
            };
            file.upsert(&account_ref, &name, credentials)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("saved {}", account_ref);
        }
        AccountsCommand::Remove { account_ref } => {
            file.remove(&account_ref)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("removed {}", account_ref);
        }
        AccountsCommand::Invalidate { account_ref } => {
            file.set_valid(&account_ref, false)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{} marked invalid", account_ref);
        }
        AccountsCommand::Validate { account_ref } => {
            file.set_valid(&account_ref, true)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{} marked valid", account_ref);
        }
    }
    Ok(())
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reelqueue")
        .join("queue.db")
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| miette::miette!("failed to create {}: {}", parent.display(), e))?;
    }
    Ok(())
}

async fn open_store(db_path: &Path) -> Result<Arc<SqliteJobStore>> {
    ensure_parent(db_path).await?;
    let store = SqliteJobStore::open(db_path).map_err(|e| miette::miette!("{}", e))?;
    Ok(Arc::new(store))
}

async fn open_engine(
    db_path: &Path,
    accounts_path: &Path,
    driver: Arc<dyn AutomationDriver>,
) -> Result<UploadEngine> {
    let store = open_store(db_path).await?;
    Ok(UploadEngine::new(
        store.clone(),
        store,
        Arc::new(FileAccountProvider::new(accounts_path)),
        driver,
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", out);
    Ok(())
}

fn print_table(views: &[JobView]) {
    println!(
        "{:<36}  {:<10}  {:>7}  {:>9}  {:<20}  {}",
        "ID", "STATUS", "ATTEMPT", "COOLDOWN", "DESTINATION", "FILE"
    );
    for view in views {
        let job = &view.job;
        let destination = if job.destination_label.is_empty() {
            &job.destination_ref
        } else {
            &job.destination_label
        };
        println!(
            "{:<36}  {:<10}  {:>7}  {:>8}s  {:<20}  {}",
            job.id,
            job.status.as_str(),
            job.attempt_count,
            view.cooldown_remaining_ms.div_ceil(1000),
            destination,
            job.file_ref
        );
    }
}
