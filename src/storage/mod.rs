// dbbackup/src/storage/mod.rs
pub(crate) mod s3;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::errors::Result;

pub use s3::S3CredentialProvider;

/// An object placed in remote storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub folder_ref: String,
}

/// Handle to a remote object store, obtained from a [`CredentialProvider`].
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Looks up a folder by exact name.
    async fn find_folder(&self, name: &str) -> Result<Option<String>>;
    async fn create_folder(&self, name: &str) -> Result<String>;
    async fn upload_file(&self, folder_ref: &str, path: &Path, name: &str) -> Result<RemoteObject>;
    /// Writes the object to `dest`; `ArtifactNotFound` when it does not exist.
    async fn download_file(&self, object_id: &str, dest: &Path) -> Result<u64>;
    async fn delete_object(&self, object_id: &str) -> Result<()>;
}

/// Owns credential acquisition and refresh. The backup subsystem only asks
/// whether a session is valid and for a client bound to it.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn is_authorized(&self) -> bool;
    async fn client(&self) -> Result<Arc<dyn StorageClient>>;
}
