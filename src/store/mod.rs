// dbbackup/src/store/mod.rs
#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;
use crate::schedule::{BackupSchedule, LastRunStatus};

pub use postgres::PgBackupStore;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunType {
    Manual,
    Scheduled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
    InProgress,
}

/// One row of backup history. Manual runs may have no owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub owner: Option<String>,
    pub artifact_id: Option<String>,
    pub artifact_name: Option<String>,
    pub artifact_size: Option<i64>,
    pub remote_folder_ref: Option<String>,
    pub run_type: RunType,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl BackupRecord {
    pub fn in_progress(owner: Option<String>, run_type: RunType, created_at: DateTime<Utc>) -> Self {
        BackupRecord {
            id: Uuid::new_v4(),
            owner,
            artifact_id: None,
            artifact_name: None,
            artifact_size: None,
            remote_folder_ref: None,
            run_type,
            status: RecordStatus::InProgress,
            created_at,
            uploaded_at: None,
            error_message: None,
        }
    }
}

/// Bookkeeping written to a schedule when one of its runs ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRunUpdate {
    pub finished_at: DateTime<Utc>,
    pub status: LastRunStatus,
    pub error: Option<String>,
    /// `None` once the schedule has been disabled.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Persisted schedules and history. All mutations go through the scheduler
/// and the run recorder.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Inserts or replaces the configuration of a schedule, leaving its
    /// run bookkeeping untouched.
    async fn upsert_schedule(&self, schedule: &BackupSchedule) -> Result<()>;
    async fn get_schedule(&self, owner: &str) -> Result<Option<BackupSchedule>>;
    async fn list_enabled_schedules(&self) -> Result<Vec<BackupSchedule>>;
    async fn delete_schedule(&self, owner: &str) -> Result<bool>;
    async fn mark_schedule_running(&self, owner: &str) -> Result<()>;
    async fn finish_schedule_run(&self, owner: &str, update: &ScheduleRunUpdate) -> Result<()>;
    async fn set_next_run(&self, owner: &str, next_run_at: DateTime<Utc>) -> Result<()>;
    async fn set_remote_folder(&self, owner: &str, folder_ref: &str) -> Result<()>;
    /// Marks schedules still flagged `in_progress` as failed. Only valid
    /// while no run is active, i.e. at startup.
    async fn fail_interrupted_schedules(&self, message: &str) -> Result<u64>;

    async fn insert_record(&self, record: &BackupRecord) -> Result<()>;
    /// Overwrites an existing row; returns false when no row has that id.
    async fn update_record(&self, record: &BackupRecord) -> Result<bool>;
    async fn list_records(&self, owner: Option<&str>, limit: i64) -> Result<Vec<BackupRecord>>;
    async fn find_record_by_artifact(&self, artifact_id: &str) -> Result<Option<BackupRecord>>;
    async fn delete_record(&self, id: Uuid) -> Result<bool>;
    /// Same as [`BackupStore::fail_interrupted_schedules`] for history rows.
    async fn fail_interrupted_records(&self, message: &str) -> Result<u64>;
}
