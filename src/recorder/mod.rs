// dbbackup/src/recorder/mod.rs
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backup::ArtifactDescriptor;
use crate::errors::{BackupError, Result};
use crate::schedule::BackupSchedule;
use crate::store::{BackupRecord, BackupStore, RecordStatus, RunType, ScheduleRunUpdate};

const INTERRUPTED_MESSAGE: &str = "interrupted: the service stopped before the run finished";

/// A run that has started. Holds the row that will receive the final status.
#[derive(Debug)]
pub struct RunHandle {
    record: BackupRecord,
    persisted: bool,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.record.id
    }
}

/// Combined view of one account for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub owner: String,
    pub schedule: Option<BackupSchedule>,
    pub timer_active: bool,
    pub run_in_progress: bool,
    pub recent_runs: Vec<BackupRecord>,
}

/// Durable bookkeeping of backup attempts. Write failures are logged and
/// swallowed: losing a history row never undoes a backup.
pub struct RunRecorder {
    store: Arc<dyn BackupStore>,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn BackupStore>) -> Self {
        RunRecorder { store }
    }

    /// Inserts the `in_progress` row.
    pub async fn begin_run(&self, owner: Option<&str>, run_type: RunType) -> RunHandle {
        let record = BackupRecord::in_progress(owner.map(str::to_string), run_type, Utc::now());
        let persisted = match self.store.insert_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                log_failure("begin run", &e);
                false
            }
        };
        RunHandle { record, persisted }
    }

    pub async fn finish_success(&self, handle: RunHandle, descriptor: &ArtifactDescriptor) -> Option<Uuid> {
        let mut record = handle.record;
        apply_descriptor(&mut record, descriptor);
        record.status = RecordStatus::Success;
        self.write_terminal(record, handle.persisted).await
    }

    pub async fn finish_failure(&self, handle: RunHandle, error: &BackupError) -> Option<Uuid> {
        let mut record = handle.record;
        record.status = RecordStatus::Failed;
        record.error_message = Some(error.to_string());
        self.write_terminal(record, handle.persisted).await
    }

    async fn write_terminal(&self, record: BackupRecord, persisted: bool) -> Option<Uuid> {
        let written = if persisted {
            match self.store.update_record(&record).await {
                Ok(true) => Ok(()),
                // The start row vanished; keep the outcome anyway.
                Ok(false) => self.store.insert_record(&record).await,
                Err(e) => Err(e),
            }
        } else {
            self.store.insert_record(&record).await
        };
        match written {
            Ok(()) => {
                debug!(record_id = %record.id, status = %record.status, "Recorded backup run");
                Some(record.id)
            }
            Err(e) => {
                log_failure("finish run", &e);
                None
            }
        }
    }

    pub async fn mark_schedule_running(&self, owner: &str) {
        if let Err(e) = self.store.mark_schedule_running(owner).await {
            log_failure("mark schedule running", &e);
        }
    }

    pub async fn finish_schedule_run(&self, owner: &str, update: &ScheduleRunUpdate) {
        if let Err(e) = self.store.finish_schedule_run(owner, update).await {
            log_failure("update schedule bookkeeping", &e);
        }
    }

    pub async fn remember_folder(&self, owner: &str, folder_ref: &str) {
        if let Err(e) = self.store.set_remote_folder(owner, folder_ref).await {
            log_failure("persist remote folder", &e);
        }
    }

    /// Runs still `in_progress` when the process starts were cut off by a
    /// crash or a kill; they are closed as failed so status stays final.
    pub async fn recover_interrupted_runs(&self) -> u64 {
        let mut recovered = 0;
        match self.store.fail_interrupted_records(INTERRUPTED_MESSAGE).await {
            Ok(count) => recovered += count,
            Err(e) => log_failure("recover interrupted records", &e),
        }
        match self.store.fail_interrupted_schedules(INTERRUPTED_MESSAGE).await {
            Ok(count) => recovered += count,
            Err(e) => log_failure("recover interrupted schedules", &e),
        }
        if recovered > 0 {
            warn!(recovered, "Closed backup runs interrupted by a restart");
        }
        recovered
    }

    /// Most recent first.
    pub async fn list_history(&self, limit: i64) -> Result<Vec<BackupRecord>> {
        self.store.list_records(None, limit.max(0)).await
    }

    pub async fn get_status(&self, owner: &str, limit: i64) -> Result<ScheduleStatus> {
        let schedule = self.store.get_schedule(owner).await?;
        let recent_runs = self.store.list_records(Some(owner), limit.max(0)).await?;
        Ok(ScheduleStatus {
            owner: owner.to_string(),
            schedule,
            timer_active: false,
            run_in_progress: false,
            recent_runs,
        })
    }
}

fn apply_descriptor(record: &mut BackupRecord, descriptor: &ArtifactDescriptor) {
    record.artifact_id = Some(descriptor.artifact_id.clone());
    record.artifact_name = Some(descriptor.name.clone());
    record.artifact_size = Some(i64::try_from(descriptor.size).unwrap_or(i64::MAX));
    record.remote_folder_ref = descriptor.remote_folder_ref.clone();
    record.uploaded_at = descriptor.uploaded_at;
    record.error_message = None;
}

fn log_failure(action: &str, cause: &BackupError) {
    let err = BackupError::RunRecorder(format!("{}: {}", action, cause));
    error!(error = %err, "History write failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Cadence, LastRunStatus, ScheduleRequest};
    use crate::store::memory::MemoryStore;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn descriptor(id: &str, remote: bool) -> ArtifactDescriptor {
        ArtifactDescriptor {
            artifact_id: id.to_string(),
            name: "backup.sql".to_string(),
            size: 42,
            has_remote: remote,
            remote_folder_ref: remote.then(|| "Database Backups".to_string()),
            local_path: (!remote).then(|| PathBuf::from("/var/backups/backup.sql")),
            created_at: Utc::now(),
            uploaded_at: remote.then(Utc::now),
        }
    }

    async fn record_success(recorder: &RunRecorder, owner: Option<&str>, artifact_id: &str) -> Option<Uuid> {
        let handle = recorder.begin_run(owner, RunType::Manual).await;
        recorder
            .finish_success(handle, &descriptor(artifact_id, false))
            .await
    }

    #[tokio::test]
    async fn started_run_transitions_once_to_terminal_state() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(store.clone());

        let handle = recorder.begin_run(Some("acme"), RunType::Scheduled).await;
        let id = handle.id();
        assert_eq!(store.records().await[0].status, RecordStatus::InProgress);

        let recorded = recorder
            .finish_success(handle, &descriptor("Database Backups/backup.sql", true))
            .await;
        assert_eq!(recorded, Some(id));

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Success);
        assert_eq!(records[0].artifact_id.as_deref(), Some("Database Backups/backup.sql"));
        assert_eq!(records[0].artifact_size, Some(42));
    }

    #[tokio::test]
    async fn failures_keep_the_error_message() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(store.clone());
        let handle = recorder.begin_run(None, RunType::Manual).await;
        recorder
            .finish_failure(handle, &BackupError::Dump("exit status 1".into()))
            .await;

        let record = &store.records().await[0];
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(record.error_message.as_deref().unwrap().contains("exit status 1"));
        assert_eq!(record.artifact_id, None);
    }

    #[tokio::test]
    async fn unwritten_start_row_is_inserted_at_the_end() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(store.clone());

        store.fail_records.store(true, Ordering::SeqCst);
        let handle = recorder.begin_run(Some("acme"), RunType::Manual).await;
        store.fail_records.store(false, Ordering::SeqCst);

        let id = recorder
            .finish_success(handle, &descriptor("local:backup.sql", false))
            .await;
        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(Some(records[0].id), id);
        assert_eq!(records[0].status, RecordStatus::Success);
    }

    #[tokio::test]
    async fn persistence_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_records.store(true, Ordering::SeqCst);
        let recorder = RunRecorder::new(store.clone());

        let id = record_success(&recorder, None, "local:backup.sql").await;
        assert_eq!(id, None);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(store.clone());
        for i in 0..5 {
            record_success(&recorder, None, &format!("local:{i}.sql")).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let history = recorder.list_history(3).await.unwrap();
        let ids: Vec<_> = history.iter().filter_map(|r| r.artifact_id.clone()).collect();
        assert_eq!(ids, ["local:4.sql", "local:3.sql", "local:2.sql"]);
    }

    #[tokio::test]
    async fn status_only_lists_that_owners_runs() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(store.clone());
        record_success(&recorder, Some("acme"), "local:a.sql").await;
        record_success(&recorder, Some("globex"), "local:b.sql").await;

        let status = recorder.get_status("acme", 10).await.unwrap();
        assert_eq!(status.owner, "acme");
        assert!(status.schedule.is_none());
        assert_eq!(status.recent_runs.len(), 1);
        assert_eq!(status.recent_runs[0].artifact_id.as_deref(), Some("local:a.sql"));
    }

    #[tokio::test]
    async fn interrupted_runs_are_closed_as_failed() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RunRecorder::new(store.clone());
        let mut schedule = ScheduleRequest {
            owner: "acme".to_string(),
            cadence: Cadence::Daily,
            time_of_day: "02:00".to_string(),
            day_of_week: None,
            day_of_month: None,
            enabled: true,
            remote_folder_ref: None,
        }
        .validate()
        .unwrap();
        schedule.last_run_status = LastRunStatus::InProgress;
        store.upsert_schedule(&schedule).await.unwrap();
        let _orphan = recorder.begin_run(Some("acme"), RunType::Scheduled).await;
        record_success(&recorder, None, "local:done.sql").await;

        assert_eq!(recorder.recover_interrupted_runs().await, 2);

        let records = store.records().await;
        let orphan = records.iter().find(|r| r.owner.as_deref() == Some("acme")).unwrap();
        assert_eq!(orphan.status, RecordStatus::Failed);
        assert!(orphan.error_message.as_deref().unwrap().starts_with("interrupted"));
        let done = records.iter().find(|r| r.owner.is_none()).unwrap();
        assert_eq!(done.status, RecordStatus::Success);

        let schedule = store.get_schedule("acme").await.unwrap().unwrap();
        assert_eq!(schedule.last_run_status, LastRunStatus::Failed);
        assert_eq!(recorder.recover_interrupted_runs().await, 0);
    }
}
