use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BackupRecord, BackupStore, RecordStatus, ScheduleRunUpdate};
use crate::errors::{BackupError, Result};
use crate::schedule::{BackupSchedule, LastRunStatus};

/// In-memory store for tests. `fail_records` makes every history write fail.
#[derive(Default)]
pub struct MemoryStore {
    schedules: Mutex<BTreeMap<String, BackupSchedule>>,
    records: Mutex<Vec<BackupRecord>>,
    pub fail_records: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<BackupRecord> {
        self.records.lock().await.clone()
    }

    fn check_records_writable(&self) -> Result<()> {
        if self.fail_records.load(Ordering::SeqCst) {
            Err(BackupError::Io(std::io::Error::other("history table unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn upsert_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        let mut schedules = self.schedules.lock().await;
        match schedules.get_mut(&schedule.owner) {
            Some(existing) => {
                existing.rule = schedule.rule;
                existing.enabled = schedule.enabled;
                if schedule.remote_folder_ref.is_some() {
                    existing.remote_folder_ref = schedule.remote_folder_ref.clone();
                }
                existing.next_run_at = schedule.next_run_at;
            }
            None => {
                schedules.insert(schedule.owner.clone(), schedule.clone());
            }
        }
        Ok(())
    }

    async fn get_schedule(&self, owner: &str) -> Result<Option<BackupSchedule>> {
        Ok(self.schedules.lock().await.get(owner).cloned())
    }

    async fn list_enabled_schedules(&self) -> Result<Vec<BackupSchedule>> {
        Ok(self
            .schedules
            .lock()
            .await
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn delete_schedule(&self, owner: &str) -> Result<bool> {
        Ok(self.schedules.lock().await.remove(owner).is_some())
    }

    async fn mark_schedule_running(&self, owner: &str) -> Result<()> {
        if let Some(schedule) = self.schedules.lock().await.get_mut(owner) {
            schedule.last_run_status = LastRunStatus::InProgress;
        }
        Ok(())
    }

    async fn finish_schedule_run(&self, owner: &str, update: &ScheduleRunUpdate) -> Result<()> {
        if let Some(schedule) = self.schedules.lock().await.get_mut(owner) {
            schedule.last_run_at = Some(update.finished_at);
            schedule.last_run_status = update.status;
            schedule.last_run_error = update.error.clone();
            schedule.next_run_at = update.next_run_at;
        }
        Ok(())
    }

    async fn set_next_run(&self, owner: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        if let Some(schedule) = self.schedules.lock().await.get_mut(owner) {
            schedule.next_run_at = Some(next_run_at);
        }
        Ok(())
    }

    async fn set_remote_folder(&self, owner: &str, folder_ref: &str) -> Result<()> {
        if let Some(schedule) = self.schedules.lock().await.get_mut(owner) {
            schedule.remote_folder_ref = Some(folder_ref.to_string());
        }
        Ok(())
    }

    async fn fail_interrupted_schedules(&self, message: &str) -> Result<u64> {
        let mut failed = 0;
        for schedule in self.schedules.lock().await.values_mut() {
            if schedule.last_run_status == LastRunStatus::InProgress {
                schedule.last_run_status = LastRunStatus::Failed;
                schedule.last_run_error = Some(message.to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn insert_record(&self, record: &BackupRecord) -> Result<()> {
        self.check_records_writable()?;
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &BackupRecord) -> Result<bool> {
        self.check_records_writable()?;
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_records(&self, owner: Option<&str>, limit: i64) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| owner.is_none() || r.owner.as_deref() == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn find_record_by_artifact(&self, artifact_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.artifact_id.as_deref() == Some(artifact_id))
            .cloned())
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool> {
        self.check_records_writable()?;
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    async fn fail_interrupted_records(&self, message: &str) -> Result<u64> {
        self.check_records_writable()?;
        let mut failed = 0;
        for record in self.records.lock().await.iter_mut() {
            if record.status == RecordStatus::InProgress {
                record.status = RecordStatus::Failed;
                record.error_message = Some(message.to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }
}
