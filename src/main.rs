//! Database Backup Scheduler
//!
//! Runs scheduled pg_dump backups with S3 upload and local fallback, and
//! exposes backup, restore and history operations over HTTP and the CLI.

// dbbackup/src/main.rs
mod api;
mod backup;
mod config;
mod errors;
mod recorder;
mod restore;
mod schedule;
mod service;
mod storage;
mod store;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use service::BackupService;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dbbackup", version, about = "Scheduled PostgreSQL backups with remote upload")]
struct Cli {
    /// Path to config.json
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and the HTTP API until interrupted
    Serve,
    /// Take one backup now
    Backup {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Overwrite the database with a backup
    Restore {
        artifact_id: String,
        /// Confirm that the current database contents will be replaced
        #[arg(long)]
        yes: bool,
    },
    /// Delete a backup artifact and its history entry
    Delete { artifact_id: String },
    /// Show recent backup runs
    History {
        #[arg(long)]
        limit: Option<i64>,
    },
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;

    if let Command::Restore { yes: false, .. } = cli.command {
        anyhow::bail!("restore replaces the entire database; re-run with --yes to confirm");
    }

    let service = Arc::new(
        BackupService::from_config(&app_config)
            .await
            .context("Failed to initialise backup service")?,
    );

    match cli.command {
        Command::Serve => serve(service, &app_config).await?,
        Command::Backup { owner } => {
            let descriptor = service.create_backup(owner).await.context("Backup failed")?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Restore { artifact_id, .. } => {
            let report = service
                .restore(&artifact_id)
                .await
                .with_context(|| format!("Restore of {} failed", artifact_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Delete { artifact_id } => {
            service
                .delete_artifact(&artifact_id)
                .await
                .with_context(|| format!("Delete of {} failed", artifact_id))?;
            println!("Deleted {}", artifact_id);
        }
        Command::History { limit } => {
            let records = service.history(limit).await.context("Failed to read history")?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

async fn serve(service: Arc<BackupService>, app_config: &AppConfig) -> Result<()> {
    service
        .start_scheduler()
        .await
        .context("Failed to load backup schedules")?;

    let listener = tokio::net::TcpListener::bind(app_config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", app_config.listen_addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
    };
    let result = api::serve(listener, service.clone(), shutdown).await;
    service.stop_scheduler();
    result.context("HTTP server failed")
}
