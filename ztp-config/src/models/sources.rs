use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{parse_bool_var, parse_csv_var, parse_duration, string_var};

/// Raw configuration as written in `ztpconfig.yaml` (or TOML/JSON). Every key
/// is optional here; required keys are enforced while composing [`Config`].
///
/// [`Config`]: crate::Config
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logfile: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tftpaddr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imgfile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_config_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_wait: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_wait: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_fs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_patterns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_timeout: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_delay: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<DurationValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_log: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_signatures: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_signatures: Option<Vec<String>>,
}

/// A duration written either as integer seconds or as a `humantime` string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(raw) => parse_duration(raw),
        }
    }

    pub fn raw(&self) -> String {
        match self {
            DurationValue::Seconds(secs) => secs.to_string(),
            DurationValue::Text(raw) => raw.clone(),
        }
    }
}

impl From<Duration> for DurationValue {
    fn from(value: Duration) -> Self {
        DurationValue::Seconds(value.as_secs())
    }
}

/// Environment-derived configuration values. Numbers and durations are kept
/// raw so the loader can report which variable is malformed.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub watch_dir: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub ssh_method: Option<String>,
    pub tftpaddr: Option<String>,
    pub imgfile: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub post_config_file: Option<PathBuf>,
    pub archive_path: Option<String>,
    pub ssh_port: Option<String>,
    pub initial_wait: Option<String>,
    pub retry_wait: Option<String>,
    pub timeout: Option<String>,
    pub max_attempts: Option<String>,
    pub device_log: Option<bool>,
    pub ignore_patterns: Option<Vec<String>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: string_var("ZTP_CONFIG").map(PathBuf::from),
            watch_dir: string_var("ZTP_WATCH_DIR").map(PathBuf::from),
            logfile: string_var("ZTP_LOGFILE").map(PathBuf::from),
            ssh_method: string_var("ZTP_SSH_METHOD"),
            tftpaddr: string_var("ZTP_TFTP_ADDR"),
            imgfile: string_var("ZTP_IMAGE_FILE"),
            username: string_var("ZTP_USERNAME"),
            password: string_var("ZTP_PASSWORD"),
            post_config_file: string_var("ZTP_POST_CONFIG_FILE").map(PathBuf::from),
            archive_path: string_var("ZTP_ARCHIVE_PATH"),
            ssh_port: string_var("ZTP_SSH_PORT"),
            initial_wait: string_var("ZTP_INITIAL_WAIT"),
            retry_wait: string_var("ZTP_RETRY_WAIT"),
            timeout: string_var("ZTP_TIMEOUT"),
            max_attempts: string_var("ZTP_MAX_ATTEMPTS"),
            device_log: parse_bool_var("ZTP_DEVICE_LOG"),
            ignore_patterns: parse_csv_var("ZTP_IGNORE_PATTERNS"),
        }
    }
}
