// dbbackup/src/backup/snapshot.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;
use which::which;

use super::artifact::LocalArtifact;
use crate::config::redact_url;
use crate::errors::{BackupError, Result};

/// Produces one consistent dump of the whole database on local disk.
#[async_trait]
pub trait SnapshotExecutor: Send + Sync {
    async fn create_snapshot(&self) -> Result<LocalArtifact>;
}

// Helper function to find pg_dump executable
fn find_pg_dump_executable() -> Result<PathBuf> {
    which("pg_dump").map_err(|_| {
        BackupError::Dump(
            "pg_dump executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH."
                .to_string(),
        )
    })
}

pub fn snapshot_file_name(created_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "backup_{}_{}.sql",
        created_at.format("%Y-%m-%d_%H_%M_%S"),
        &suffix[..8]
    )
}

/// Plain-SQL dump that drops and recreates every object it contains, so
/// applying it overwrites the target database.
fn pg_dump_args(database_url: &str, output: &Path, exclude_tables: &[String]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--format=plain".into(),
        "--no-owner".into(),
        "--no-privileges".into(),
        "--clean".into(),
        "--if-exists".into(),
        "--file".into(),
        output.as_os_str().to_os_string(),
    ];
    for table in exclude_tables {
        args.push(format!("--exclude-table={}", table).into());
    }
    args.push(database_url.into());
    args
}

/// Rejects missing or empty dump output.
pub async fn verify_dump_file(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await.map_err(|_| {
        BackupError::Dump(format!("dump output {} is missing", path.display()))
    })?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(BackupError::Dump(format!(
            "dump output {} is empty",
            path.display()
        )));
    }
    Ok(metadata.len())
}

/// In-flight dump output. Removed on drop unless it was moved into place,
/// so a cancelled or failed dump never leaves a file behind.
struct PartialDump {
    path: PathBuf,
    finished: bool,
}

impl PartialDump {
    fn new(path: PathBuf) -> Self {
        PartialDump {
            path,
            finished: false,
        }
    }

    async fn finish(mut self, final_path: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, final_path).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for PartialDump {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(file = %self.path.display(), "Removed unfinished dump"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %self.path.display(), error = %e, "Failed to remove unfinished dump"),
        }
    }
}

/// Runs `pg_dump`. pg_dump reads the whole database inside one
/// repeatable-read transaction, so concurrent writers cannot tear the dump.
pub struct PgDumpExecutor {
    database_url: String,
    output_dir: PathBuf,
    exclude_tables: Vec<String>,
}

impl PgDumpExecutor {
    pub fn new(database_url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        PgDumpExecutor {
            database_url: database_url.into(),
            output_dir: output_dir.into(),
            exclude_tables: Vec::new(),
        }
    }

    /// Tables left out of every snapshot (the backup bookkeeping itself).
    pub fn excluding(mut self, tables: &[&str]) -> Self {
        self.exclude_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }
}

#[async_trait]
impl SnapshotExecutor for PgDumpExecutor {
    async fn create_snapshot(&self) -> Result<LocalArtifact> {
        let pg_dump_path = find_pg_dump_executable()?;
        tokio::fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            BackupError::Dump(format!(
                "Failed to create backup directory {}: {}",
                self.output_dir.display(),
                e
            ))
        })?;

        let created_at = Utc::now();
        let name = snapshot_file_name(created_at);
        let final_path = self.output_dir.join(&name);
        // Written under a temporary name so an interrupted dump never looks complete.
        let partial = PartialDump::new(self.output_dir.join(format!("{}.partial", name)));

        info!(
            database = %redact_url(&self.database_url),
            file = %final_path.display(),
            "Starting pg_dump"
        );
        let output = Command::new(&pg_dump_path)
            .args(pg_dump_args(&self.database_url, &partial.path, &self.exclude_tables))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Dump(format!("Failed to execute pg_dump: {}", e)))?;

        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "pg_dump failed with status: {}\nStderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size = verify_dump_file(&partial.path).await?;
        partial.finish(&final_path).await.map_err(|e| {
            BackupError::Dump(format!(
                "Failed to finalize dump file {}: {}",
                final_path.display(),
                e
            ))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(stderr = %stderr.trim(), "pg_dump reported warnings");
        }
        debug!(file = %final_path.display(), size, "pg_dump finished");

        Ok(LocalArtifact {
            path: final_path,
            name,
            size,
            created_at,
        })
    }
}
