// dbbackup/src/restore/mod.rs
pub(crate) mod psql;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backup::ArtifactId;
use crate::errors::{BackupError, Result};
use crate::storage::CredentialProvider;
use crate::store::BackupStore;

pub use psql::{PsqlRestoreTarget, RestoreTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub artifact_id: String,
    pub from_remote: bool,
    pub size: u64,
}

/// Resolves artifact ids to readable dump files and hands them to the
/// [`RestoreTarget`]. Also owns removal of artifacts.
pub struct RestoreExecutor {
    store: Arc<dyn BackupStore>,
    credentials: Arc<dyn CredentialProvider>,
    target: Arc<dyn RestoreTarget>,
    local_dir: PathBuf,
    temp_dir: PathBuf,
    // One destructive apply at a time.
    apply_lock: Mutex<()>,
}

impl RestoreExecutor {
    pub fn new(
        store: Arc<dyn BackupStore>,
        credentials: Arc<dyn CredentialProvider>,
        target: Arc<dyn RestoreTarget>,
        local_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        RestoreExecutor {
            store,
            credentials,
            target,
            local_dir: local_dir.into(),
            temp_dir: temp_dir.into(),
            apply_lock: Mutex::new(()),
        }
    }

    /// Overwrites the database with the artifact's contents.
    pub async fn restore(&self, artifact_id: &str) -> Result<RestoreReport> {
        let id = ArtifactId::parse(artifact_id)?;
        let _apply = self.apply_lock.lock().await;
        info!(artifact_id = %id, "Restore requested");

        match id.local_path(&self.local_dir) {
            Some(path) => self.restore_local(&id, &path).await,
            None => self.restore_remote(&id).await,
        }
    }

    async fn restore_local(&self, id: &ArtifactId, path: &Path) -> Result<RestoreReport> {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => return Err(BackupError::ArtifactNotFound(id.to_string())),
        };
        self.target.apply(path).await?;
        info!(artifact_id = %id, size, "Restore from local artifact complete");
        Ok(RestoreReport {
            artifact_id: id.to_string(),
            from_remote: false,
            size,
        })
    }

    async fn restore_remote(&self, id: &ArtifactId) -> Result<RestoreReport> {
        if !self.credentials.is_authorized().await {
            return Err(BackupError::NotAuthorized);
        }
        let client = self.credentials.client().await.map_err(as_restore_error)?;

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let download = tempfile::Builder::new()
            .prefix("restore_")
            .suffix(".sql")
            .tempfile_in(&self.temp_dir)?;

        let object_id = id.to_string();
        let applied: Result<u64> = async {
            let size = client
                .download_file(&object_id, download.path())
                .await
                .map_err(as_restore_error)?;
            if size == 0 {
                return Err(BackupError::Restore(format!(
                    "downloaded artifact {} is empty",
                    object_id
                )));
            }
            self.target.apply(download.path()).await?;
            Ok(size)
        }
        .await;

        let temp_path = download.path().to_path_buf();
        if let Err(e) = download.close() {
            warn!(file = %temp_path.display(), error = %e, "Failed to remove temporary download");
        }

        let size = applied?;
        info!(artifact_id = %object_id, size, "Restore from remote artifact complete");
        Ok(RestoreReport {
            artifact_id: object_id,
            from_remote: true,
            size,
        })
    }

    /// Removes the artifact and its history row. Ids unknown to history are
    /// rejected before anything is touched.
    pub async fn delete_artifact(&self, artifact_id: &str) -> Result<()> {
        let id = ArtifactId::parse(artifact_id)?;
        let record = self
            .store
            .find_record_by_artifact(&id.to_string())
            .await?
            .ok_or_else(|| BackupError::ArtifactNotFound(id.to_string()))?;

        match id.local_path(&self.local_dir) {
            Some(path) => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(file = %path.display(), "Local artifact already gone, removing history row");
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let client = self.credentials.client().await?;
                client.delete_object(&id.to_string()).await?;
            }
        }

        self.store.delete_record(record.id).await?;
        info!(artifact_id = %id, record_id = %record.id, "Deleted backup artifact");
        Ok(())
    }
}

// Storage trouble while fetching an artifact is a restore failure; only a
// missing object keeps its own kind.
fn as_restore_error(err: BackupError) -> BackupError {
    match err {
        BackupError::ArtifactNotFound(_) | BackupError::Restore(_) => err,
        other => BackupError::Restore(format!("download failed: {}", other)),
    }
}
