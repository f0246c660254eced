// dbbackup/src/backup/mod.rs
pub(crate) mod artifact;
pub(crate) mod snapshot;
pub(crate) mod upload;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{BackupError, Result};
use crate::recorder::RunRecorder;
use crate::storage::RemoteObject;
use crate::store::RunType;

pub use artifact::{ArtifactDescriptor, ArtifactId, LocalArtifact};
pub use snapshot::{PgDumpExecutor, SnapshotExecutor};
pub use upload::RemoteUploader;

/// What triggered a run and where its artifact should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub run_type: RunType,
    pub owner: Option<String>,
    pub folder_ref: Option<String>,
}

impl RunRequest {
    pub fn manual(owner: Option<String>) -> Self {
        RunRequest {
            run_type: RunType::Manual,
            owner,
            folder_ref: None,
        }
    }

    pub fn scheduled(owner: impl Into<String>, folder_ref: Option<String>) -> Self {
        RunRequest {
            run_type: RunType::Scheduled,
            owner: Some(owner.into()),
            folder_ref,
        }
    }
}

/// Outcome of one Backup Run. `record_id` is `None` when the history row
/// could not be written.
#[derive(Debug)]
pub struct RunReport {
    pub record_id: Option<Uuid>,
    pub outcome: Result<ArtifactDescriptor>,
}

enum SnapshotStep {
    Created(LocalArtifact),
    Failed(BackupError),
}

enum UploadStep {
    Uploaded(RemoteObject),
    LocalOnly(BackupError),
}

/// snapshot -> upload -> record, each step under one overall deadline.
pub struct BackupRunner {
    snapshots: Arc<dyn SnapshotExecutor>,
    uploader: RemoteUploader,
    recorder: Arc<RunRecorder>,
    run_timeout: Duration,
}

impl BackupRunner {
    pub fn new(
        snapshots: Arc<dyn SnapshotExecutor>,
        uploader: RemoteUploader,
        recorder: Arc<RunRecorder>,
        run_timeout: Duration,
    ) -> Self {
        BackupRunner {
            snapshots,
            uploader,
            recorder,
            run_timeout,
        }
    }

    pub fn recorder(&self) -> &Arc<RunRecorder> {
        &self.recorder
    }

    /// Never fails as a whole: every error ends up in the report and in history.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let owner = request.owner.as_deref().unwrap_or("-");
        let deadline = Instant::now() + self.run_timeout;
        info!(owner = %owner, run_type = %request.run_type, "Backup run started");
        let handle = self
            .recorder
            .begin_run(request.owner.as_deref(), request.run_type)
            .await;
        debug!(record_id = %handle.id(), "History row opened");

        let artifact = match self.snapshot_step(deadline).await {
            SnapshotStep::Created(artifact) => artifact,
            SnapshotStep::Failed(err) => {
                error!(owner = %owner, error = %err, "Backup run failed");
                let record_id = self.recorder.finish_failure(handle, &err).await;
                return RunReport {
                    record_id,
                    outcome: Err(err),
                };
            }
        };

        let descriptor = match self
            .upload_step(&artifact, request.folder_ref.as_deref(), deadline)
            .await
        {
            UploadStep::Uploaded(object) => {
                if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                    warn!(
                        file = %artifact.path.display(),
                        error = %e,
                        "Uploaded artifact could not be removed locally"
                    );
                }
                remote_descriptor(&artifact, object)
            }
            UploadStep::LocalOnly(err) => {
                warn!(
                    owner = %owner,
                    error = %err,
                    file = %artifact.path.display(),
                    "Remote upload unavailable, keeping local artifact"
                );
                local_descriptor(&artifact)
            }
        };

        let record_id = self.recorder.finish_success(handle, &descriptor).await;
        info!(
            owner = %owner,
            artifact_id = %descriptor.artifact_id,
            remote = descriptor.has_remote,
            "Backup run finished"
        );
        RunReport {
            record_id,
            outcome: Ok(descriptor),
        }
    }

    async fn snapshot_step(&self, deadline: Instant) -> SnapshotStep {
        match timeout_at(deadline, self.snapshots.create_snapshot()).await {
            Ok(Ok(artifact)) => SnapshotStep::Created(artifact),
            Ok(Err(err)) => SnapshotStep::Failed(err),
            Err(_) => SnapshotStep::Failed(BackupError::Dump(format!(
                "snapshot did not finish within {}s",
                self.run_timeout.as_secs()
            ))),
        }
    }

    async fn upload_step(&self, artifact: &LocalArtifact, folder_ref: Option<&str>, deadline: Instant) -> UploadStep {
        match timeout_at(deadline, self.uploader.upload(artifact, folder_ref)).await {
            Ok(Ok(object)) => UploadStep::Uploaded(object),
            Ok(Err(err)) => UploadStep::LocalOnly(err),
            Err(_) => UploadStep::LocalOnly(BackupError::Upload(format!(
                "upload did not finish within {}s",
                self.run_timeout.as_secs()
            ))),
        }
    }
}

fn remote_descriptor(artifact: &LocalArtifact, object: RemoteObject) -> ArtifactDescriptor {
    ArtifactDescriptor {
        artifact_id: object.id,
        name: object.name,
        size: object.size,
        has_remote: true,
        remote_folder_ref: Some(object.folder_ref),
        local_path: None,
        created_at: artifact.created_at,
        uploaded_at: Some(Utc::now()),
    }
}

fn local_descriptor(artifact: &LocalArtifact) -> ArtifactDescriptor {
    ArtifactDescriptor {
        artifact_id: ArtifactId::local(&artifact.name).to_string(),
        name: artifact.name.clone(),
        size: artifact.size,
        has_remote: false,
        remote_folder_ref: None,
        local_path: Some(artifact.path.clone()),
        created_at: artifact.created_at,
        uploaded_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStatus;
    use crate::store::memory::MemoryStore;
    use crate::test_support::{FakeCredentials, FakeSnapshots, FakeStorage};
    use std::sync::atomic::Ordering;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        storage: Arc<FakeStorage>,
        snapshots: Arc<FakeSnapshots>,
    }

    fn runner(authorized: bool, timeout: Duration) -> (Harness, BackupRunner) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(FakeStorage::default());
        let snapshots = Arc::new(FakeSnapshots::new(dir.path()));
        let credentials = if authorized {
            FakeCredentials::new(storage.clone())
        } else {
            FakeCredentials::unauthorized()
        };
        let runner = BackupRunner::new(
            snapshots.clone(),
            RemoteUploader::new(Arc::new(credentials), "Database Backups"),
            Arc::new(RunRecorder::new(store.clone())),
            timeout,
        );
        (
            Harness {
                _dir: dir,
                store,
                storage,
                snapshots,
            },
            runner,
        )
    }

    #[tokio::test]
    async fn successful_upload_removes_local_file_and_records_remote_id() {
        let (h, runner) = runner(true, Duration::from_secs(30));
        let report = runner.run(RunRequest::manual(None)).await;
        let descriptor = report.outcome.unwrap();

        assert!(descriptor.has_remote);
        assert!(descriptor.artifact_id.starts_with("Database Backups/"));
        let local = h.snapshots.last_path().unwrap();
        assert!(!local.exists(), "local artifact should be removed after upload");
        assert!(h.storage.has_object(&descriptor.artifact_id).await);

        let records = h.store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(Some(records[0].id), report.record_id);
        assert_eq!(records[0].status, RecordStatus::Success);
        assert_eq!(records[0].artifact_id.as_deref(), Some(descriptor.artifact_id.as_str()));
    }

    #[tokio::test]
    async fn failed_upload_falls_back_to_local_artifact() {
        let (h, runner) = runner(true, Duration::from_secs(30));
        h.storage.fail_uploads.store(true, Ordering::SeqCst);

        let descriptor = runner.run(RunRequest::manual(None)).await.outcome.unwrap();
        assert!(!descriptor.has_remote);
        assert!(descriptor.artifact_id.starts_with("local:"));
        assert!(descriptor.local_path.as_ref().unwrap().exists());

        let record = &h.store.records().await[0];
        assert_eq!(record.status, RecordStatus::Success);
        assert_eq!(record.remote_folder_ref, None);
        assert_eq!(record.artifact_id.as_deref(), Some(descriptor.artifact_id.as_str()));
    }

    #[tokio::test]
    async fn unauthorized_storage_falls_back_to_local_artifact() {
        let (h, runner) = runner(false, Duration::from_secs(30));
        let descriptor = runner.run(RunRequest::manual(None)).await.outcome.unwrap();
        assert!(!descriptor.has_remote);
        assert!(h.snapshots.last_path().unwrap().exists());
    }

    #[tokio::test]
    async fn dump_failure_is_recorded_as_failed() {
        let (h, runner) = runner(true, Duration::from_secs(30));
        h.snapshots.fail.store(true, Ordering::SeqCst);

        let report = runner.run(RunRequest::scheduled("acme", None)).await;
        assert!(matches!(report.outcome, Err(BackupError::Dump(_))));
        let record = &h.store.records().await[0];
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.owner.as_deref(), Some("acme"));
        assert_eq!(record.run_type, RunType::Scheduled);
    }

    #[tokio::test]
    async fn slow_snapshot_times_out_as_dump_error() {
        let (h, runner) = runner(true, Duration::from_millis(50));
        h.snapshots.set_delay(Duration::from_secs(5));

        let report = runner.run(RunRequest::manual(None)).await;
        assert!(matches!(report.outcome, Err(BackupError::Dump(ref m)) if m.contains("did not finish")));
        assert_eq!(h.store.records().await[0].status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn history_loss_does_not_fail_the_run() {
        let (h, runner) = runner(true, Duration::from_secs(30));
        h.store.fail_records.store(true, Ordering::SeqCst);

        let report = runner.run(RunRequest::manual(None)).await;
        assert!(report.outcome.is_ok());
        assert_eq!(report.record_id, None);
    }
}
