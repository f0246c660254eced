use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid schedule configuration: {0}")]
    ScheduleConfig(String),

    #[error("Database dump failed: {0}")]
    Dump(String),

    #[error("Remote storage is not authorized")]
    NotAuthorized,

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Failed to record backup run: {0}")]
    RunRecorder(String),

    #[error("Backup artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("A backup run for '{0}' is already in progress")]
    RunInProgress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Stable identifier for the error kind, surfaced to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::ScheduleConfig(_) => "schedule_config",
            BackupError::Dump(_) => "dump",
            BackupError::NotAuthorized => "not_authorized",
            BackupError::Upload(_) => "upload",
            BackupError::RunRecorder(_) => "run_recorder",
            BackupError::ArtifactNotFound(_) => "artifact_not_found",
            BackupError::Restore(_) => "restore",
            BackupError::RunInProgress(_) => "run_in_progress",
            BackupError::Config(_) => "config",
            BackupError::Database(_) => "database",
            BackupError::Io(_) => "io",
        }
    }

    /// Remote failures never fail a Backup Run; the artifact stays local instead.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, BackupError::NotAuthorized | BackupError::Upload(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
