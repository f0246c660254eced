// dbbackup/src/restore/psql.rs
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;
use which::which;

use crate::config::redact_url;
use crate::errors::{BackupError, Result};

/// Capability that applies a dump file to a database. Applying is a
/// destructive full overwrite; there is no rollback once it has started.
#[async_trait]
pub trait RestoreTarget: Send + Sync {
    async fn apply(&self, dump_file: &Path) -> Result<()>;
}

/// Finds the psql executable in the system PATH.
fn find_psql_executable() -> Result<PathBuf> {
    which("psql").map_err(|_| {
        BackupError::Restore(
            "psql executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH."
                .to_string(),
        )
    })
}

fn psql_args(database_url: &str, dump_file: &Path) -> Vec<OsString> {
    vec![
        "-X".into(), // Do not read psqlrc
        "-q".into(), // Quiet mode
        "-v".into(),
        "ON_ERROR_STOP=1".into(), // Exit on first error
        "-d".into(),
        database_url.into(),
        "-f".into(),
        dump_file.as_os_str().to_os_string(),
    ]
}

/// Replays a plain-SQL dump with `psql` against the live database.
pub struct PsqlRestoreTarget {
    database_url: String,
}

impl PsqlRestoreTarget {
    pub fn new(database_url: impl Into<String>) -> Self {
        PsqlRestoreTarget {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl RestoreTarget for PsqlRestoreTarget {
    async fn apply(&self, dump_file: &Path) -> Result<()> {
        let psql_path = find_psql_executable()?;
        info!(
            file = %dump_file.display(),
            database = %redact_url(&self.database_url),
            "Applying dump with psql"
        );

        let output = Command::new(psql_path)
            .args(psql_args(&self.database_url, dump_file))
            .output()
            .await
            .map_err(|e| BackupError::Restore(format!("Failed to execute psql: {}", e)))?;

        if !output.status.success() {
            return Err(BackupError::Restore(format!(
                "psql failed for file {}.\nStatus: {}\nStderr: {}",
                dump_file.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
