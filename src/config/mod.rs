// dbbackup/src/config/mod.rs
use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_REMOTE_FOLDER_NAME: &str = "Database Backups";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8085";
const DEFAULT_HISTORY_LIMIT: i64 = 20;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub state_database_url: Option<String>,
    pub local_backup_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub utc_offset_minutes: Option<i32>,
    pub run_timeout_secs: Option<u64>,
    pub remote_folder_name: Option<String>,
    pub listen_addr: Option<String>,
    pub history_limit: Option<i64>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub state_database_url: String,
    pub local_backup_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub schedule_offset: FixedOffset,
    pub run_timeout: Duration,
    pub remote_folder_name: String,
    pub listen_addr: SocketAddr,
    pub history_limit: i64,
    pub spaces_config: Option<SpacesConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                raw_json_config.database_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("STATE_DATABASE_URL") {
            if !url.trim().is_empty() {
                raw_json_config.state_database_url = Some(url);
            }
        }

        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let database_url = raw
            .database_url
            .filter(|s| !s.trim().is_empty())
            .context("database_url must be set in config.json or DATABASE_URL")?;
        Url::parse(&database_url).context("database_url is not a valid URL")?;

        let state_database_url = raw
            .state_database_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| database_url.clone());

        let local_backup_dir = raw
            .local_backup_dir
            .context("local_backup_dir must be set in config.json")?;
        if local_backup_dir.to_string_lossy().is_empty() {
            anyhow::bail!("local_backup_dir cannot be empty in config.json.");
        }
        let temp_dir = raw
            .temp_dir
            .filter(|p| !p.to_string_lossy().is_empty())
            .unwrap_or_else(|| local_backup_dir.join("tmp"));

        let offset_minutes = raw.utc_offset_minutes.unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);
        let schedule_offset = FixedOffset::east_opt(offset_minutes * 60).with_context(|| {
            format!("utc_offset_minutes {} is out of range", offset_minutes)
        })?;

        let run_timeout_secs = raw.run_timeout_secs.unwrap_or(DEFAULT_RUN_TIMEOUT_SECS);
        if run_timeout_secs == 0 {
            anyhow::bail!("run_timeout_secs must be greater than zero");
        }

        let remote_folder_name = raw
            .remote_folder_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_REMOTE_FOLDER_NAME.to_string());

        let listen_addr = raw
            .listen_addr
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDR)
            .parse::<SocketAddr>()
            .context("listen_addr must be a socket address such as 127.0.0.1:8085")?;

        let history_limit = raw.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);

        Ok(AppConfig {
            database_url,
            state_database_url,
            local_backup_dir,
            temp_dir,
            schedule_offset,
            run_timeout: Duration::from_secs(run_timeout_secs),
            remote_folder_name,
            listen_addr,
            history_limit,
            spaces_config: raw.s3_storage.as_ref().and_then(spaces_config_from_raw),
        })
    }

    /// Schedules and history share the snapshotted database.
    pub fn state_is_in_snapshot(&self) -> bool {
        self.state_database_url == self.database_url
    }
}

fn spaces_config_from_raw(s3_raw: &JsonS3StorageConfig) -> Option<SpacesConfig> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(SpacesConfig {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
        })
    } else {
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn if some S3 fields were provided but were incomplete/empty
            warn!(
                "s3_storage is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty. Backups will be kept locally only."
            );
        }
        None
    }
}

/// Strips the password from a connection URL so it can be logged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
