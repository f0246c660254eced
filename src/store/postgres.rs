// dbbackup/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use super::{BackupRecord, BackupStore, RecordStatus, RunType, ScheduleRunUpdate};
use crate::config::redact_url;
use crate::errors::{BackupError, Result};
use crate::schedule::{BackupSchedule, Cadence, LastRunStatus, ScheduleRule, TimeOfDay};

pub const SCHEDULE_TABLE: &str = "backup_schedules";
pub const RECORD_TABLE: &str = "backup_records";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS backup_schedules (
        owner TEXT PRIMARY KEY,
        cadence TEXT NOT NULL,
        hour SMALLINT NOT NULL,
        minute SMALLINT NOT NULL,
        day_of_week SMALLINT,
        day_of_month SMALLINT,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        remote_folder_ref TEXT,
        last_run_at TIMESTAMPTZ,
        last_run_status TEXT NOT NULL DEFAULT 'none',
        last_run_error TEXT,
        next_run_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backup_records (
        id UUID PRIMARY KEY,
        owner TEXT,
        artifact_id TEXT,
        artifact_name TEXT,
        artifact_size BIGINT,
        remote_folder_ref TEXT,
        run_type TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        uploaded_at TIMESTAMPTZ,
        error_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS backup_records_created_at_idx ON backup_records (created_at DESC)",
    "CREATE INDEX IF NOT EXISTS backup_records_artifact_id_idx ON backup_records (artifact_id)",
];

const SCHEDULE_COLUMNS: &str = "owner, cadence, hour, minute, day_of_week, day_of_month, enabled, \
     remote_folder_ref, last_run_at, last_run_status, last_run_error, next_run_at";

const RECORD_COLUMNS: &str = "id, owner, artifact_id, artifact_name, artifact_size, remote_folder_ref, \
     run_type, status, created_at, uploaded_at, error_message";

#[derive(Debug, FromRow)]
struct ScheduleRow {
    owner: String,
    cadence: String,
    hour: i16,
    minute: i16,
    day_of_week: Option<i16>,
    day_of_month: Option<i16>,
    enabled: bool,
    remote_folder_ref: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    last_run_status: String,
    last_run_error: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
}

impl TryFrom<ScheduleRow> for BackupSchedule {
    type Error = BackupError;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        let cadence: Cadence = row.cadence.parse().map_err(|_| {
            BackupError::ScheduleConfig(format!("unknown cadence '{}' for '{}'", row.cadence, row.owner))
        })?;
        let time_of_day = TimeOfDay::new(
            u32::try_from(row.hour).unwrap_or(u32::MAX),
            u32::try_from(row.minute).unwrap_or(u32::MAX),
        )?;
        let rule = ScheduleRule::new(
            cadence,
            time_of_day,
            row.day_of_week.map(i64::from),
            row.day_of_month.map(i64::from),
        )?;
        let last_run_status = row
            .last_run_status
            .parse::<LastRunStatus>()
            .unwrap_or(LastRunStatus::NotRun);

        Ok(BackupSchedule {
            owner: row.owner,
            rule,
            enabled: row.enabled,
            remote_folder_ref: row.remote_folder_ref,
            last_run_at: row.last_run_at,
            last_run_status,
            last_run_error: row.last_run_error,
            next_run_at: row.next_run_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    owner: Option<String>,
    artifact_id: Option<String>,
    artifact_name: Option<String>,
    artifact_size: Option<i64>,
    remote_folder_ref: Option<String>,
    run_type: String,
    status: String,
    created_at: DateTime<Utc>,
    uploaded_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<RecordRow> for BackupRecord {
    type Error = BackupError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let run_type: RunType = row.run_type.parse().map_err(|_| {
            BackupError::RunRecorder(format!("unknown run_type '{}' on record {}", row.run_type, row.id))
        })?;
        let status: RecordStatus = row.status.parse().map_err(|_| {
            BackupError::RunRecorder(format!("unknown status '{}' on record {}", row.status, row.id))
        })?;
        Ok(BackupRecord {
            id: row.id,
            owner: row.owner,
            artifact_id: row.artifact_id,
            artifact_name: row.artifact_name,
            artifact_size: row.artifact_size,
            remote_folder_ref: row.remote_folder_ref,
            run_type,
            status,
            created_at: row.created_at,
            uploaded_at: row.uploaded_at,
            error_message: row.error_message,
        })
    }
}

/// Postgres-backed schedule and history tables.
#[derive(Debug, Clone)]
pub struct PgBackupStore {
    pool: PgPool,
}

impl PgBackupStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!(url = %redact_url(database_url), "Connecting to backup state database");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgBackupStore { pool }
    }

    /// Creates the bookkeeping tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn small(value: Option<u8>) -> Option<i16> {
    value.map(i16::from)
}

#[async_trait]
impl BackupStore for PgBackupStore {
    async fn upsert_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_schedules
                (owner, cadence, hour, minute, day_of_week, day_of_month, enabled, remote_folder_ref, next_run_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (owner) DO UPDATE SET
                cadence = EXCLUDED.cadence,
                hour = EXCLUDED.hour,
                minute = EXCLUDED.minute,
                day_of_week = EXCLUDED.day_of_week,
                day_of_month = EXCLUDED.day_of_month,
                enabled = EXCLUDED.enabled,
                remote_folder_ref = COALESCE(EXCLUDED.remote_folder_ref, backup_schedules.remote_folder_ref),
                next_run_at = EXCLUDED.next_run_at,
                updated_at = NOW()
            "#,
        )
        .bind(&schedule.owner)
        .bind(schedule.rule.recurrence.cadence().to_string())
        .bind(schedule.rule.time_of_day.hour() as i16)
        .bind(schedule.rule.time_of_day.minute() as i16)
        .bind(small(schedule.rule.day_of_week()))
        .bind(small(schedule.rule.day_of_month()))
        .bind(schedule.enabled)
        .bind(&schedule.remote_folder_ref)
        .bind(schedule.next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, owner: &str) -> Result<Option<BackupSchedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM backup_schedules WHERE owner = $1",
            SCHEDULE_COLUMNS
        ))
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BackupSchedule::try_from).transpose()
    }

    async fn list_enabled_schedules(&self) -> Result<Vec<BackupSchedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {} FROM backup_schedules WHERE enabled = TRUE ORDER BY owner",
            SCHEDULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let owner = row.owner.clone();
            match BackupSchedule::try_from(row) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => warn!(owner = %owner, error = %e, "Skipping unreadable schedule row"),
            }
        }
        Ok(schedules)
    }

    async fn delete_schedule(&self, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_schedules WHERE owner = $1")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_schedule_running(&self, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backup_schedules SET last_run_status = $1, updated_at = NOW() WHERE owner = $2",
        )
        .bind(LastRunStatus::InProgress.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_schedule_run(&self, owner: &str, update: &ScheduleRunUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backup_schedules
            SET last_run_at = $1, last_run_status = $2, last_run_error = $3, next_run_at = $4, updated_at = NOW()
            WHERE owner = $5
            "#,
        )
        .bind(update.finished_at)
        .bind(update.status.to_string())
        .bind(&update.error)
        .bind(update.next_run_at)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_next_run(&self, owner: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE backup_schedules SET next_run_at = $1, updated_at = NOW() WHERE owner = $2")
            .bind(next_run_at)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_remote_folder(&self, owner: &str, folder_ref: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backup_schedules SET remote_folder_ref = $1, updated_at = NOW() WHERE owner = $2",
        )
        .bind(folder_ref)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_interrupted_schedules(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE backup_schedules
            SET last_run_status = $1, last_run_error = $2, updated_at = NOW()
            WHERE last_run_status = $3
            "#,
        )
        .bind(LastRunStatus::Failed.to_string())
        .bind(message)
        .bind(LastRunStatus::InProgress.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_record(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO backup_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            RECORD_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.owner)
        .bind(&record.artifact_id)
        .bind(&record.artifact_name)
        .bind(record.artifact_size)
        .bind(&record.remote_folder_ref)
        .bind(record.run_type.to_string())
        .bind(record.status.to_string())
        .bind(record.created_at)
        .bind(record.uploaded_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_record(&self, record: &BackupRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backup_records
            SET artifact_id = $1, artifact_name = $2, artifact_size = $3, remote_folder_ref = $4,
                status = $5, uploaded_at = $6, error_message = $7
            WHERE id = $8
            "#,
        )
        .bind(&record.artifact_id)
        .bind(&record.artifact_name)
        .bind(record.artifact_size)
        .bind(&record.remote_folder_ref)
        .bind(record.status.to_string())
        .bind(record.uploaded_at)
        .bind(&record.error_message)
        .bind(record.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_records(&self, owner: Option<&str>, limit: i64) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM backup_records WHERE ($1::TEXT IS NULL OR owner = $1) \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            RECORD_COLUMNS
        ))
        .bind(owner)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    async fn find_record_by_artifact(&self, artifact_id: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM backup_records WHERE artifact_id = $1 ORDER BY created_at DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BackupRecord::try_from).transpose()
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_interrupted_records(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE backup_records SET status = $1, error_message = $2 WHERE status = $3",
        )
        .bind(RecordStatus::Failed.to_string())
        .bind(message)
        .bind(RecordStatus::InProgress.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
