//! Runtime configuration loaded from the environment

use crate::mail::{ImapConfig, SecurityType};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "MAILMIRROR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("could not determine a data directory, set MAILMIRROR_DB")]
    NoDataDir,
}

/// Knobs of one sync invocation
#[derive(Debug, Clone, Serialize)]
pub struct SyncSettings {
    /// UIDs per fetch command
    pub batch: usize,
    /// Body worker pool width; 0 parses inline
    pub pool: usize,
    /// Upper bound on stored sizes per body fetch
    pub body_batch_bytes: u64,
    /// Canonical folder markers in priority order
    pub labels: Vec<String>,
    pub attachments: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch: 1000,
            pool: 2,
            body_batch_bytes: 32 * 1024 * 1024,
            labels: vec!["\\All".into(), "\\Junk".into(), "\\Trash".into()],
            attachments: None,
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub account: String,
    pub imap: ImapConfig,
    /// Password used to seed the credential store when it has none
    pub password: Option<String>,
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub notify_url: String,
    pub settings: SyncSettings,
    pub idle_timeout: Duration,
    pub flags_interval: Duration,
    pub backoff: Duration,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.clone(),
        reason: e.to_string(),
    })
}

impl SyncConfig {
    /// Load from process environment variables (after `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve `MAILMIRROR_*` variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let parsed = |name: &str| -> Result<Option<u64>, ConfigError> {
            var(name)
                .map(|v| parse_value(&format!("{}{}", PREFIX, name), v))
                .transpose()
        };

        let account = var("ACCOUNT").ok_or_else(|| ConfigError::Missing("MAILMIRROR_ACCOUNT".into()))?;

        let security: SecurityType = match var("IMAP_SECURITY") {
            Some(v) => parse_value("MAILMIRROR_IMAP_SECURITY", v)?,
            None => SecurityType::SSL,
        };
        let port = match var("IMAP_PORT") {
            Some(v) => parse_value::<u16>("MAILMIRROR_IMAP_PORT", v)?,
            None => security.default_imap_port(),
        };
        let imap = ImapConfig {
            host: var("IMAP_HOST").unwrap_or_else(|| "imap.gmail.com".to_string()),
            port,
            security,
            username: var("IMAP_USER").unwrap_or_else(|| account.clone()),
            password: String::new(),
            accept_invalid_certs: false,
        };

        let data_dir = match var("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => directories::ProjectDirs::from("org", "mailmirror", "mailmirror")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(ConfigError::NoDataDir)?,
        };
        let db_path = var("DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("mailmirror.db"));

        let defaults = SyncSettings::default();
        let labels = match var("LABELS") {
            Some(list) => list
                .split(',')
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            None => defaults.labels,
        };
        let settings = SyncSettings {
            batch: parsed("BATCH")?.map(|v| v as usize).unwrap_or(defaults.batch),
            pool: parsed("POOL")?.map(|v| v as usize).unwrap_or(defaults.pool),
            body_batch_bytes: parsed("BODY_BATCH_BYTES")?.unwrap_or(defaults.body_batch_bytes),
            labels,
            attachments: var("ATTACHMENTS").map(PathBuf::from),
        };
        if settings.batch == 0 {
            return Err(ConfigError::Invalid {
                key: "MAILMIRROR_BATCH".into(),
                value: "0".into(),
                reason: "batch size must be positive".into(),
            });
        }

        Ok(Self {
            account,
            imap,
            password: var("IMAP_PASSWORD"),
            db_path,
            data_dir,
            notify_url: var("NOTIFY_URL")
                .unwrap_or_else(|| "http://localhost:5001/notify/".to_string()),
            settings,
            idle_timeout: Duration::from_secs(parsed("IDLE_TIMEOUT")?.unwrap_or(1200)),
            flags_interval: Duration::from_secs(parsed("FLAGS_INTERVAL")?.unwrap_or(300)),
            backoff: Duration::from_secs(parsed("BACKOFF")?.unwrap_or(10)),
        })
    }
}
