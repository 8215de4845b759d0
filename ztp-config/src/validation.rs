use std::time::Duration;

use thiserror::Error;

use crate::models::Config;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("imgfile '{0}' must be a bare file name without path separators")]
    InvalidImageName(String),
    #[error("watch_dir {0} does not exist")]
    WatchDirMissing(String),
    #[error("watch_dir {0} is not a directory")]
    WatchDirNotDirectory(String),
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.probe.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroAttempts);
    }
    if config.probe.timeout.is_zero() {
        return Err(ConfigGuardRailError::ZeroDuration { field: "timeout" });
    }
    if config.session.command_timeout.is_zero() {
        return Err(ConfigGuardRailError::ZeroDuration {
            field: "command_timeout",
        });
    }
    if config.session.transfer_timeout.is_zero() {
        return Err(ConfigGuardRailError::ZeroDuration {
            field: "transfer_timeout",
        });
    }

    let image = config.firmware.image_file.trim();
    if image.is_empty() || image.contains(['/', '\\']) {
        return Err(ConfigGuardRailError::InvalidImageName(
            config.firmware.image_file.clone(),
        ));
    }

    let dir = &config.watch.dir;
    if !dir.exists() {
        return Err(ConfigGuardRailError::WatchDirMissing(
            dir.display().to_string(),
        ));
    }
    if !dir.is_dir() {
        return Err(ConfigGuardRailError::WatchDirNotDirectory(
            dir.display().to_string(),
        ));
    }

    if config.session.transfer_timeout < config.session.command_timeout {
        warnings.push_with_hint(
            "transfer_timeout is shorter than command_timeout",
            "Image copies are the slowest command; raise transfer_timeout (default 30m)",
        );
    }

    if config.probe.initial_wait.is_zero() {
        warnings.push(
            "initial_wait is zero; the first reachability attempt runs while the device is \
             likely still booting",
        );
    }

    // Overflow means a budget far past the warning threshold.
    let budget = config
        .probe
        .retry_wait
        .checked_add(config.probe.timeout)
        .and_then(|per_retry| per_retry.checked_mul(config.probe.max_attempts.saturating_sub(1)))
        .and_then(|retries| retries.checked_add(config.probe.initial_wait));
    if let Some(budget) = budget.filter(|budget| *budget < Duration::from_secs(60)) {
        warnings.push(format!(
            "reachability budget is only {}; devices reloading into new firmware usually need \
             several minutes",
            humantime::format_duration(budget)
        ));
    }

    if let Some(parent) = config.logfile.parent()
        && !parent.as_os_str().is_empty()
        && !parent.is_dir()
    {
        warnings.push_with_hint(
            format!("logfile directory {} does not exist", parent.display()),
            "Create the directory or point logfile somewhere writable",
        );
    }

    if config.archive_path.as_deref().is_some_and(|p| p.trim_matches('/').is_empty()) {
        warnings.push("archive_path is empty; archives land in the TFTP root");
    }

    Ok(warnings)
}
