pub mod sources;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ztp_core::probe::ProbeSettings;
use ztp_core::session::{Credentials, SessionSettings};
use ztp_core::trigger::{ResolutionMode, TriggerSettings};
use ztp_core::upgrade::{OutputClassifier, SignatureRule, UpgradePlan, Verdict};
use ztp_core::DispatchSettings;

/// Fully composed, immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub watch: WatchConfig,
    pub logfile: PathBuf,
    pub firmware: FirmwareConfig,
    pub credentials: Credentials,
    pub post_config: Option<PostConfig>,
    pub archive_path: Option<String>,
    pub probe: ProbeSettings,
    pub session: SessionConfig,
    pub device_log: bool,
    pub signatures: SignatureConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn trigger_settings(&self) -> TriggerSettings {
        TriggerSettings {
            resolution: self.watch.resolution,
            ignore_patterns: self.watch.ignore_patterns.clone(),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        self.probe.clone()
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            port: self.session.port,
            platform: self.session.platform.clone(),
            command_timeout: self.session.command_timeout,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            settle_delay: self.watch.settle_delay,
            port: self.session.port,
            platform: self.session.platform.clone(),
            shutdown_grace: self.watch.shutdown_grace,
        }
    }

    pub fn classifier(&self) -> OutputClassifier {
        let mut classifier = OutputClassifier::default();
        classifier.extend(
            self.signatures
                .prompt
                .iter()
                .map(|needle| SignatureRule::new(needle.as_str(), Verdict::PromptBlocked))
                .chain(
                    self.signatures
                        .error
                        .iter()
                        .map(|needle| SignatureRule::new(needle.as_str(), Verdict::Error)),
                ),
        );
        classifier
    }

    pub fn upgrade_plan(&self) -> Arc<UpgradePlan> {
        Arc::new(UpgradePlan {
            tftp_address: self.firmware.tftp_address.clone(),
            image_file: self.firmware.image_file.clone(),
            flash_fs: self.firmware.flash_fs.clone(),
            post_config: self.post_config.as_ref().map(|post| post.lines.clone()),
            archive_prefix: self.archive_path.clone(),
            transfer_timeout: self.session.transfer_timeout,
            mirror_to_device: self.device_log,
            classifier: self.classifier(),
        })
    }

    /// Effective settings as `(key, value)` pairs with the password redacted.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let human = |d: Duration| humantime::format_duration(d).to_string();
        vec![
            ("watch_dir", self.watch.dir.display().to_string()),
            ("logfile", self.logfile.display().to_string()),
            ("ssh_method", self.watch.resolution.to_string()),
            ("ignore_patterns", self.watch.ignore_patterns.join(", ")),
            ("tftpaddr", self.firmware.tftp_address.clone()),
            ("imgfile", self.firmware.image_file.clone()),
            ("flash_fs", self.firmware.flash_fs.clone()),
            ("username", self.credentials.username.clone()),
            ("password", "<redacted>".to_string()),
            (
                "post_config_file",
                self.post_config
                    .as_ref()
                    .map(|post| format!("{} ({} lines)", post.path.display(), post.lines.len()))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            (
                "archive_path",
                self.archive_path.clone().unwrap_or_else(|| "-".to_string()),
            ),
            ("ssh_port", self.session.port.to_string()),
            ("platform", self.session.platform.clone()),
            ("initial_wait", human(self.probe.initial_wait)),
            ("retry_wait", human(self.probe.retry_wait)),
            ("timeout", human(self.probe.timeout)),
            ("max_attempts", self.probe.max_attempts.to_string()),
            ("command_timeout", human(self.session.command_timeout)),
            ("transfer_timeout", human(self.session.transfer_timeout)),
            ("settle_delay", human(self.watch.settle_delay)),
            ("shutdown_grace", human(self.watch.shutdown_grace)),
            ("device_log", self.device_log.to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub dir: PathBuf,
    pub resolution: ResolutionMode,
    pub ignore_patterns: Vec<String>,
    pub settle_delay: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct FirmwareConfig {
    pub tftp_address: String,
    pub image_file: String,
    pub flash_fs: String,
}

/// Post-provisioning configuration block read from `post_config_file`.
#[derive(Debug, Clone)]
pub struct PostConfig {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: u16,
    pub platform: String,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
}

/// Operator-supplied classifier signatures appended to the built-in table.
#[derive(Debug, Clone, Default)]
pub struct SignatureConfig {
    pub prompt: Vec<String>,
    pub error: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    /// Format implied by a file extension, if recognised.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "toml" => Some(ConfigFormat::Toml),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yaml",
            ConfigFormat::Toml => "toml",
            ConfigFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub format: Option<ConfigFormat>,
    pub env_file_loaded: bool,
}
