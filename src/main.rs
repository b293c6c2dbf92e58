//! # Fleetsync Entry Point
//!
//! `serve` drives the scheduler clock when this process wins the process
//! lock; other workers skip the clock and idle until shutdown. `migrate`
//! applies migrations, `jobs` inspects and triggers registered jobs.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetsync::{
    adapters::AdapterRegistry,
    audit::DbAuditSink,
    bridge::{BackgroundBridge, TaskOutcome},
    config::{AppConfig, ConfigLoader},
    db,
    error::{ApiError, CoreError},
    pipeline::CollectionPipeline,
    process_lock::{release_process_lock, try_acquire_process_lock},
    repositories::{DbCollectionStore, DbInstanceRegistry},
    runs::RunTracker,
    scheduler::{JobStore, SchedulerService},
    sessions::SyncSessionService,
    tasks::TaskRunner,
    telemetry,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "fleetsync", version, about = "Database fleet sync and scheduling core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run migrations, then drive the scheduler if this process owns the lock
    Serve,
    /// Apply pending database migrations
    Migrate,
    /// Inspect or trigger scheduled jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    /// List registered jobs
    List,
    /// Run a job immediately and wait for it to finish
    Run {
        id: String,
        /// Actor recorded on the session or run
        #[arg(long)]
        created_by: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    if let Ok(redacted) = config.redacted_json() {
        info!(profile = %config.profile, config = %redacted, "configuration loaded");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await,
        Command::Migrate => {
            Migrator::up(&db, None).await.context("applying migrations")?;
            info!("migrations applied");
            Ok(())
        }
        Command::Jobs { command } => {
            let scheduler = build_scheduler(&config, Arc::new(db))?;
            match command {
                JobsCommand::List => list_jobs(&scheduler).await,
                JobsCommand::Run { id, created_by } => run_job(&scheduler, &id, created_by).await,
            }
        }
    }
}

/// Wires the sync core together around one connection pool.
fn build_scheduler(config: &AppConfig, db: Arc<DatabaseConnection>) -> Result<SchedulerService> {
    let audit = Arc::new(DbAuditSink::new(db.clone()));
    let instances = Arc::new(DbInstanceRegistry::new(db.clone()));
    let store = Arc::new(DbCollectionStore::new(db.clone()));

    let pipeline = CollectionPipeline::new(AdapterRegistry::with_builtin(), store.clone())
        .with_step_timeout_seconds(config.sync.step_timeout_seconds);
    let sessions =
        SyncSessionService::new(db.clone(), instances.clone(), Arc::new(pipeline), audit.clone());
    let runs = RunTracker::new(db.clone(), audit.clone());
    let tasks = TaskRunner::new(
        sessions,
        runs,
        BackgroundBridge::new(audit),
        instances,
        store,
    );

    SchedulerService::new(config.scheduler.clone(), JobStore::new(db), Arc::new(tasks))
        .map_err(report)
        .context("building scheduler")
}

async fn serve(config: AppConfig, db: DatabaseConnection) -> Result<()> {
    Migrator::up(&db, None).await.context("applying migrations")?;
    db::health_check(&db).await.context("database health check")?;

    let scheduler = build_scheduler(&config, Arc::new(db))?;
    let owns_clock = config.scheduler.enabled && try_acquire_process_lock(&config.scheduler.lock_path);

    if owns_clock {
        scheduler.start().await.map_err(report).context("starting scheduler")?;
    } else if !config.scheduler.enabled {
        info!("scheduler disabled by configuration");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    if owns_clock {
        scheduler.shutdown().await;
        release_process_lock();
    }
    Ok(())
}

async fn list_jobs(scheduler: &SchedulerService) -> Result<()> {
    let jobs = scheduler.list_jobs().await.map_err(report)?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn run_job(scheduler: &SchedulerService, id: &str, created_by: Option<String>) -> Result<()> {
    let overrides = created_by.map(|actor| serde_json::json!({ "created_by": actor }));
    let handle = scheduler.run_now(id, overrides).await.map_err(report)?;
    info!(job_id = %id, trace_id = %handle.trace_id(), "job launched");

    match handle.wait().await {
        TaskOutcome::Completed => {
            info!(job_id = %id, "job finished");
            Ok(())
        }
        TaskOutcome::Failed(failure) => {
            warn!(job_id = %id, error = %failure.message, "job failed");
            anyhow::bail!("job {id} failed: {}", failure.message)
        }
    }
}

/// Prints the client-facing problem body and keeps the full error for the caller.
fn report(error: CoreError) -> anyhow::Error {
    let message = error.to_string();
    let problem = ApiError::from(error);
    if let Ok(body) = serde_json::to_string(&problem) {
        eprintln!("{body}");
    }
    anyhow::anyhow!(message)
}
