// dbbackup/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt; // For write_all
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CredentialProvider, RemoteObject, StorageClient};
use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};

/// Credentials for an S3-compatible service (DigitalOcean Spaces, MinIO, AWS).
/// Without a complete `s3_storage` block the provider is never authorized.
pub struct S3CredentialProvider {
    spaces_config: Option<SpacesConfig>,
    client: OnceCell<Arc<S3StorageClient>>,
}

impl S3CredentialProvider {
    pub fn new(spaces_config: Option<SpacesConfig>) -> Self {
        S3CredentialProvider {
            spaces_config,
            client: OnceCell::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for S3CredentialProvider {
    async fn is_authorized(&self) -> bool {
        self.spaces_config.is_some()
    }

    async fn client(&self) -> Result<Arc<dyn StorageClient>> {
        let spaces_config = self.spaces_config.as_ref().ok_or(BackupError::NotAuthorized)?;
        let client = self
            .client
            .get_or_init(|| async { Arc::new(S3StorageClient::connect(spaces_config).await) })
            .await;
        let client: Arc<dyn StorageClient> = client.clone();
        Ok(client)
    }
}

pub struct S3StorageClient {
    client: s3::Client,
    bucket_name: String,
    folder_prefix: Option<String>,
}

impl S3StorageClient {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        debug!(
            endpoint = %spaces_config.endpoint_url,
            bucket = %spaces_config.bucket_name,
            "Building S3 client"
        );
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        S3StorageClient {
            client: s3::Client::new(&sdk_config),
            bucket_name: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config.folder_prefix.clone(),
        }
    }
}

/// Folders are key prefixes; `<folder>/` is stored as a zero-byte marker object.
fn folder_ref_for(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

fn folder_marker_key(folder_ref: &str) -> String {
    format!("{}/", folder_ref.trim_end_matches('/'))
}

fn object_key(folder_ref: &str, file_name: &str) -> String {
    format!("{}/{}", folder_ref.trim_end_matches('/'), file_name)
}

fn object_name(object_id: &str) -> &str {
    object_id.rsplit('/').next().unwrap_or(object_id)
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn find_folder(&self, name: &str) -> Result<Option<String>> {
        let folder_ref = folder_ref_for(self.folder_prefix.as_deref(), name);
        match self
            .client
            .head_object()
            .bucket(&self.bucket_name)
            .key(folder_marker_key(&folder_ref))
            .send()
            .await
        {
            Ok(_) => Ok(Some(folder_ref)),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(BackupError::Upload(format!(
                        "Failed to look up folder {} in bucket {}: {}",
                        folder_ref,
                        self.bucket_name,
                        DisplayErrorContext(&err)
                    )))
                }
            }
        }
    }

    async fn create_folder(&self, name: &str) -> Result<String> {
        let folder_ref = folder_ref_for(self.folder_prefix.as_deref(), name);
        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(folder_marker_key(&folder_ref))
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|err| {
                BackupError::Upload(format!(
                    "Failed to create folder {} in bucket {}: {}",
                    folder_ref,
                    self.bucket_name,
                    DisplayErrorContext(&err)
                ))
            })?;
        info!(folder = %folder_ref, bucket = %self.bucket_name, "Created remote backup folder");
        Ok(folder_ref)
    }

    async fn upload_file(&self, folder_ref: &str, path: &Path, name: &str) -> Result<RemoteObject> {
        let key = object_key(folder_ref, name);
        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path).await.map_err(|err| {
            BackupError::Upload(format!(
                "Failed to create ByteStream from file {}: {}",
                path.display(),
                err
            ))
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                BackupError::Upload(format!(
                    "Failed to upload file {} to bucket {} with key {}: {}",
                    path.display(),
                    self.bucket_name,
                    key,
                    DisplayErrorContext(&err)
                ))
            })?;

        Ok(RemoteObject {
            id: key,
            name: name.to_string(),
            size,
            folder_ref: folder_ref.to_string(),
        })
    }

    async fn download_file(&self, object_id: &str, dest: &Path) -> Result<u64> {
        let mut object = match self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(object_id)
            .send()
            .await
        {
            Ok(object) => object,
            Err(err) => {
                let err = err.into_service_error();
                return Err(if err.is_no_such_key() {
                    BackupError::ArtifactNotFound(object_id.to_string())
                } else {
                    BackupError::Upload(format!(
                        "Failed to get object s3://{}/{}: {}",
                        self.bucket_name,
                        object_id,
                        DisplayErrorContext(&err)
                    ))
                });
            }
        };

        let mut output_file = File::create(dest).await?;
        let mut total_bytes_downloaded: u64 = 0;
        while let Some(bytes_chunk) = object.body.try_next().await.map_err(|err| {
            BackupError::Upload(format!(
                "Download of {} ({}) was interrupted: {}",
                object_id,
                object_name(object_id),
                err
            ))
        })? {
            output_file.write_all(&bytes_chunk).await?;
            total_bytes_downloaded += bytes_chunk.len() as u64;
        }
        output_file.flush().await?;

        debug!(
            object_id = %object_id,
            bytes = total_bytes_downloaded,
            dest = %dest.display(),
            "Downloaded remote artifact"
        );
        Ok(total_bytes_downloaded)
    }

    async fn delete_object(&self, object_id: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(object_id)
            .send()
            .await
            .map_err(|err| {
                BackupError::Upload(format!(
                    "Failed to delete s3://{}/{}: {}",
                    self.bucket_name,
                    object_id,
                    DisplayErrorContext(&err)
                ))
            })?;
        Ok(())
    }
}
