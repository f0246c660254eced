// dbbackup/src/backup/artifact.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};

const LOCAL_PREFIX: &str = "local:";

/// Identifier of a backup artifact. Remote ids are the storage object id;
/// local ids are minted here for artifacts that only exist on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactId {
    Local(String),
    Remote(String),
}

impl ArtifactId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BackupError::ArtifactNotFound("<empty artifact id>".to_string()));
        }
        match raw.strip_prefix(LOCAL_PREFIX) {
            Some(name) => {
                validate_file_name(name).map_err(|_| BackupError::ArtifactNotFound(raw.to_string()))?;
                Ok(ArtifactId::Local(name.to_string()))
            }
            None => Ok(ArtifactId::Remote(raw.to_string())),
        }
    }

    pub fn local(name: &str) -> Self {
        ArtifactId::Local(name.to_string())
    }

    /// Path of a locally-scoped artifact inside `dir`.
    pub fn local_path(&self, dir: &Path) -> Option<PathBuf> {
        match self {
            ArtifactId::Local(name) => Some(dir.join(name)),
            ArtifactId::Remote(_) => None,
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactId::Local(name) => write!(f, "{}{}", LOCAL_PREFIX, name),
            ArtifactId::Remote(id) => f.write_str(id),
        }
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        Err(BackupError::ArtifactNotFound(name.to_string()))
    } else {
        Ok(())
    }
}

/// A verified dump file on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// What a finished Backup Run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDescriptor {
    pub artifact_id: String,
    pub name: String,
    pub size: u64,
    pub has_remote: bool,
    pub remote_folder_ref: Option<String>,
    pub local_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
}
