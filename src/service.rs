// dbbackup/src/service.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use tracing::info;

use crate::backup::{ArtifactDescriptor, BackupRunner, PgDumpExecutor, RemoteUploader, SnapshotExecutor};
use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::recorder::{RunRecorder, ScheduleStatus};
use crate::restore::{PsqlRestoreTarget, RestoreExecutor, RestoreReport, RestoreTarget};
use crate::schedule::{BackupSchedule, ScheduleRequest, SchedulerRegistry};
use crate::storage::{CredentialProvider, S3CredentialProvider};
use crate::store::{BackupRecord, BackupStore, PgBackupStore, postgres};

/// Collaborators and settings a [`BackupService`] is assembled from.
pub struct ServiceParts {
    pub store: Arc<dyn BackupStore>,
    pub snapshots: Arc<dyn SnapshotExecutor>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub restore_target: Arc<dyn RestoreTarget>,
    pub local_backup_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub schedule_offset: FixedOffset,
    pub run_timeout: Duration,
    pub remote_folder_name: String,
    pub history_limit: i64,
}

/// Every operation the CLI and the HTTP API expose.
pub struct BackupService {
    registry: Arc<SchedulerRegistry>,
    recorder: Arc<RunRecorder>,
    restorer: RestoreExecutor,
    history_limit: i64,
}

impl BackupService {
    pub fn new(parts: ServiceParts) -> Self {
        let recorder = Arc::new(RunRecorder::new(parts.store.clone()));
        let runner = Arc::new(BackupRunner::new(
            parts.snapshots,
            RemoteUploader::new(parts.credentials.clone(), parts.remote_folder_name),
            recorder.clone(),
            parts.run_timeout,
        ));
        let registry = SchedulerRegistry::new(parts.store.clone(), runner, parts.schedule_offset);
        let restorer = RestoreExecutor::new(
            parts.store,
            parts.credentials,
            parts.restore_target,
            parts.local_backup_dir,
            parts.temp_dir,
        );
        BackupService {
            registry,
            recorder,
            restorer,
            history_limit: parts.history_limit,
        }
    }

    /// Connects to the state database, migrates it and wires the pg_dump,
    /// S3 and psql implementations.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.local_backup_dir)
            .await
            .map_err(|e| {
                BackupError::Config(format!(
                    "local_backup_dir {} cannot be created: {}",
                    config.local_backup_dir.display(),
                    e
                ))
            })?;
        let store = PgBackupStore::connect(&config.state_database_url).await?;
        store.migrate().await?;

        let mut snapshots = PgDumpExecutor::new(&config.database_url, &config.local_backup_dir);
        if config.state_is_in_snapshot() {
            // A restore must never rewrite the history that points at it.
            snapshots = snapshots.excluding(&[postgres::SCHEDULE_TABLE, postgres::RECORD_TABLE]);
        }
        let credentials = S3CredentialProvider::new(config.spaces_config.clone());
        if !credentials.is_authorized().await {
            info!("Remote storage is not configured; backups will be kept locally only");
        }

        Ok(Self::new(ServiceParts {
            store: Arc::new(store),
            snapshots: Arc::new(snapshots),
            credentials: Arc::new(credentials),
            restore_target: Arc::new(PsqlRestoreTarget::new(&config.database_url)),
            local_backup_dir: config.local_backup_dir.clone(),
            temp_dir: config.temp_dir.clone(),
            schedule_offset: config.schedule_offset,
            run_timeout: config.run_timeout,
            remote_folder_name: config.remote_folder_name.clone(),
            history_limit: config.history_limit,
        }))
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    /// Closes runs a previous process left open, then loads every enabled
    /// schedule and starts its timer.
    pub async fn start_scheduler(&self) -> Result<usize> {
        self.recorder.recover_interrupted_runs().await;
        let timers = self.registry.reload().await?;
        info!(timers, offset = %self.registry.offset(), "Scheduler started");
        Ok(timers)
    }

    pub fn stop_scheduler(&self) {
        self.registry.shutdown();
    }

    pub async fn upsert_schedule(&self, request: &ScheduleRequest) -> Result<BackupSchedule> {
        self.registry.upsert_schedule(request).await
    }

    pub async fn delete_schedule(&self, owner: &str) -> Result<bool> {
        self.registry.delete_schedule(owner).await
    }

    pub async fn status(&self, owner: &str) -> Result<ScheduleStatus> {
        let mut status = self.recorder.get_status(owner, self.history_limit).await?;
        status.timer_active = self.registry.has_timer(owner);
        status.run_in_progress = self.registry.is_running(owner);
        Ok(status)
    }

    pub async fn create_backup(&self, owner: Option<String>) -> Result<ArtifactDescriptor> {
        self.registry.run_manual(owner).await?.outcome
    }

    /// Destructive: replaces the database contents with the artifact.
    pub async fn restore(&self, artifact_id: &str) -> Result<RestoreReport> {
        self.restorer.restore(artifact_id).await
    }

    pub async fn delete_artifact(&self, artifact_id: &str) -> Result<()> {
        self.restorer.delete_artifact(artifact_id).await
    }

    pub async fn history(&self, limit: Option<i64>) -> Result<Vec<BackupRecord>> {
        self.recorder
            .list_history(limit.unwrap_or(self.history_limit))
            .await
    }
}
