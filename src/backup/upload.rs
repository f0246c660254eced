// dbbackup/src/backup/upload.rs
use std::sync::Arc;
use tracing::{debug, info};

use super::artifact::LocalArtifact;
use crate::errors::{BackupError, Result};
use crate::storage::{CredentialProvider, RemoteObject, StorageClient};

/// Places local artifacts into remote storage. Every failure comes back as
/// either `NotAuthorized` or `Upload` so the caller can fall back to the
/// local copy.
pub struct RemoteUploader {
    credentials: Arc<dyn CredentialProvider>,
    folder_name: String,
}

impl RemoteUploader {
    pub fn new(credentials: Arc<dyn CredentialProvider>, folder_name: impl Into<String>) -> Self {
        RemoteUploader {
            credentials,
            folder_name: folder_name.into(),
        }
    }

    /// Uploads into `folder_ref`, or into the well-known backup folder
    /// (created if absent) when no folder is known yet.
    pub async fn upload(&self, artifact: &LocalArtifact, folder_ref: Option<&str>) -> Result<RemoteObject> {
        if !self.credentials.is_authorized().await {
            return Err(BackupError::NotAuthorized);
        }
        let client = self.credentials.client().await.map_err(as_remote_error)?;

        let folder_ref = match folder_ref {
            Some(folder_ref) => folder_ref.to_string(),
            None => self.ensure_folder(client.as_ref()).await?,
        };

        info!(
            file = %artifact.path.display(),
            folder = %folder_ref,
            size = artifact.size,
            "Uploading backup artifact"
        );
        let object = client
            .upload_file(&folder_ref, &artifact.path, &artifact.name)
            .await
            .map_err(as_remote_error)?;
        info!(artifact_id = %object.id, "Upload complete");
        Ok(object)
    }

    async fn ensure_folder(&self, client: &dyn StorageClient) -> Result<String> {
        if let Some(folder_ref) = client
            .find_folder(&self.folder_name)
            .await
            .map_err(as_remote_error)?
        {
            debug!(folder = %folder_ref, "Found existing backup folder");
            return Ok(folder_ref);
        }
        client
            .create_folder(&self.folder_name)
            .await
            .map_err(as_remote_error)
    }
}

fn as_remote_error(err: BackupError) -> BackupError {
    if err.is_remote_failure() {
        err
    } else {
        BackupError::Upload(err.to_string())
    }
}
