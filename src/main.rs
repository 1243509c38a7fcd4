//! # Notiflow — Scheduled Notification Runner
//!
//! Fires recurring notification tasks every minute and delivers them to a
//! webhook or directly by email.
//!
//! Usage:
//!   notiflow                          # Audit tasks, then run the scheduler loop
//!   notiflow tick                     # Run a single tick now
//!   notiflow trigger <task-id>        # Fire one task immediately
//!   notiflow history <task-id>        # Print a task's execution ledger
//!   notiflow import tasks.json        # Upsert task documents, versioning content changes
//!   notiflow rollback <task-id> 2     # Restore template and email settings from version 2
//!   notiflow audit                    # Backfill webhooks, report bad email settings

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notiflow_channels::SmtpMailer;
use notiflow_core::NotiflowConfig;
use notiflow_scheduler::{FiringOutcome, SchedulerEngine, SqliteTaskStore, Task, spawn_scheduler};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "notiflow",
    version,
    about = "⏰ Notiflow — scheduled notifications via webhook and email"
)]
struct Cli {
    /// Config file (default: ~/.notiflow/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Task database path (overrides [store].path)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Audit tasks, then run the per-minute loop until Ctrl-C
    Run,
    /// Run exactly one tick now
    Tick,
    /// Fire one task now, regardless of its schedule
    Trigger { task_id: String },
    /// Print a task's execution history as JSON
    History { task_id: String },
    /// Upsert an array of task documents from a JSON file
    Import {
        file: String,
        /// Recorded as `changedBy` on new versions
        #[arg(long)]
        changed_by: Option<String>,
    },
    /// Restore a task's template, variables and email settings from a version
    Rollback {
        task_id: String,
        version: u32,
        #[arg(long)]
        changed_by: Option<String>,
    },
    /// Backfill missing webhooks and report invalid email settings
    Audit,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn describe(outcome: &FiringOutcome) -> String {
    match outcome {
        FiringOutcome::Recorded { status, error: None } => status.to_string(),
        FiringOutcome::Recorded {
            status,
            error: Some(e),
        } => format!("{status}: {e}"),
        FiringOutcome::AlreadyFired => "already fired this minute".to_string(),
        FiringOutcome::StoreError(e) => format!("store error: {e}"),
    }
}

fn load_config(path: Option<&str>) -> Result<NotiflowConfig> {
    match path {
        Some(p) => {
            let mut config = NotiflowConfig::load_from(Path::new(&expand_path(p)))?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Ok(NotiflowConfig::load()?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "notiflow=debug,notiflow_scheduler=debug,notiflow_channels=debug,notiflow_core=debug"
    } else {
        "notiflow=info,notiflow_scheduler=info,notiflow_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let db_path = match &cli.db_path {
        Some(p) => PathBuf::from(expand_path(p)),
        None => config.store.resolved_path(),
    };

    let store = Arc::new(
        SqliteTaskStore::open(&db_path)
            .with_context(|| format!("opening task store at {}", db_path.display()))?,
    );
    let mailer = Arc::new(SmtpMailer::new(config.smtp.clone()));
    let engine = Arc::new(SchedulerEngine::from_config(&config, store, mailer)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            engine.audit_tasks().await?;
            tokio::select! {
                _ = spawn_scheduler(engine.clone()) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("👋 Shutting down scheduler");
                }
            }
        }
        Command::Tick => {
            let report = engine.tick().await;
            println!(
                "⏱️  Tick at {}: {} active tasks scanned, {} fired",
                report.at.to_rfc3339(),
                report.scanned,
                report.outcomes.len()
            );
            for outcome in &report.outcomes {
                println!("   {} → {}", outcome.task_id, describe(&outcome.outcome));
            }
            for error in &report.store_errors {
                println!("   ⚠️  {error}");
            }
        }
        Command::Trigger { task_id } => {
            let outcome = engine.trigger_now(&task_id).await?;
            println!("👆 {} → {}", outcome.task_id, describe(&outcome.outcome));
        }
        Command::History { task_id } => {
            let records = engine.execution_history(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Import { file, changed_by } => {
            let path = expand_path(&file);
            let content = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            let tasks: Vec<Task> = serde_json::from_str(&content).with_context(|| format!("parsing {path}"))?;
            let count = tasks.len();
            for task in tasks {
                let id = task.id.clone();
                if let Some(version) = engine.upsert_task(task, changed_by.as_deref()).await? {
                    println!("   {id} → v{version}");
                }
            }
            println!("✅ Imported {count} tasks into {}", db_path.display());
        }
        Command::Rollback {
            task_id,
            version,
            changed_by,
        } => {
            let restored = engine
                .rollback_task(&task_id, version, changed_by.as_deref())
                .await?;
            println!("⏪ {task_id} rolled back to version {version} (now v{restored})");
        }
        Command::Audit => {
            let report = engine.audit_tasks().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
