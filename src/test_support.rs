// dbbackup/src/test_support.rs
//! Test doubles for the external collaborators: pg_dump, remote storage,
//! credentials and psql.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::backup::{LocalArtifact, SnapshotExecutor};
use crate::errors::{BackupError, Result};
use crate::restore::RestoreTarget;
use crate::storage::{CredentialProvider, RemoteObject, StorageClient};

pub fn write_artifact(dir: &Path, name: &str) -> LocalArtifact {
    let path = dir.join(name);
    let body = format!("-- dump {}\nCREATE TABLE t ();\n", name);
    std::fs::write(&path, &body).unwrap();
    LocalArtifact {
        path,
        name: name.to_string(),
        size: body.len() as u64,
        created_at: Utc::now(),
    }
}

/// Writes small dump files and tracks how many calls overlap.
pub struct FakeSnapshots {
    dir: PathBuf,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    delay: std::sync::Mutex<Duration>,
    last: std::sync::Mutex<Option<PathBuf>>,
}

impl FakeSnapshots {
    pub fn new(dir: &Path) -> Self {
        FakeSnapshots {
            dir: dir.to_path_buf(),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            delay: std::sync::Mutex::new(Duration::ZERO),
            last: std::sync::Mutex::new(None),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn last_path(&self) -> Option<PathBuf> {
        self.last.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotExecutor for FakeSnapshots {
    async fn create_snapshot(&self) -> Result<LocalArtifact> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackupError::Dump("pg_dump exited with status 1".to_string()));
        }
        let artifact = write_artifact(&self.dir, &format!("backup_{:04}.sql", n));
        *self.last.lock().unwrap() = Some(artifact.path.clone());
        Ok(artifact)
    }
}

/// Remote storage kept in memory. Folder refs equal folder names.
#[derive(Default)]
pub struct FakeStorage {
    folders: Mutex<BTreeSet<String>>,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fail_uploads: AtomicBool,
    pub create_folder_calls: AtomicUsize,
}

impl FakeStorage {
    pub async fn add_folder(&self, name: &str) {
        self.folders.lock().await.insert(name.to_string());
    }

    pub async fn put_object(&self, id: &str, body: &[u8]) {
        self.objects.lock().await.insert(id.to_string(), body.to_vec());
    }

    pub async fn has_object(&self, id: &str) -> bool {
        self.objects.lock().await.contains_key(id)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            Err(BackupError::Upload("connection reset by peer".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn find_folder(&self, name: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.folders.lock().await.get(name).cloned())
    }

    async fn create_folder(&self, name: &str) -> Result<String> {
        self.check_reachable()?;
        self.create_folder_calls.fetch_add(1, Ordering::SeqCst);
        self.folders.lock().await.insert(name.to_string());
        Ok(name.to_string())
    }

    async fn upload_file(&self, folder_ref: &str, path: &Path, name: &str) -> Result<RemoteObject> {
        self.check_reachable()?;
        let body = tokio::fs::read(path).await?;
        let id = format!("{}/{}", folder_ref, name);
        let size = body.len() as u64;
        self.objects.lock().await.insert(id.clone(), body);
        Ok(RemoteObject {
            id,
            name: name.to_string(),
            size,
            folder_ref: folder_ref.to_string(),
        })
    }

    async fn download_file(&self, object_id: &str, dest: &Path) -> Result<u64> {
        self.check_reachable()?;
        let body = self
            .objects
            .lock()
            .await
            .get(object_id)
            .cloned()
            .ok_or_else(|| BackupError::ArtifactNotFound(object_id.to_string()))?;
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn delete_object(&self, object_id: &str) -> Result<()> {
        self.check_reachable()?;
        self.objects.lock().await.remove(object_id);
        Ok(())
    }
}

pub struct FakeCredentials {
    storage: Option<Arc<FakeStorage>>,
}

impl FakeCredentials {
    pub fn new(storage: Arc<FakeStorage>) -> Self {
        FakeCredentials {
            storage: Some(storage),
        }
    }

    pub fn unauthorized() -> Self {
        FakeCredentials { storage: None }
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn is_authorized(&self) -> bool {
        self.storage.is_some()
    }

    async fn client(&self) -> Result<Arc<dyn StorageClient>> {
        let storage = self.storage.clone().ok_or(BackupError::NotAuthorized)?;
        let client: Arc<dyn StorageClient> = storage;
        Ok(client)
    }
}

/// Captures the contents of every applied dump.
#[derive(Default)]
pub struct RecordingTarget {
    applied: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingTarget {
    pub async fn applied(&self) -> Vec<String> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl RestoreTarget for RecordingTarget {
    async fn apply(&self, dump_file: &Path) -> Result<()> {
        let contents = tokio::fs::read_to_string(dump_file)
            .await
            .map_err(|e| BackupError::Restore(e.to_string()))?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackupError::Restore("ERROR: syntax error at or near \"garbage\"".to_string()));
        }
        self.applied.lock().await.push(contents);
        Ok(())
    }
}
