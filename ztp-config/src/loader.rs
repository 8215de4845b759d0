pub mod error;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use ztp_core::probe::ProbeSettings;
use ztp_core::session::Credentials;
use ztp_core::trigger::{ResolutionMode, default_ignore_patterns};

use crate::models::sources::{DurationValue, EnvConfig, FileConfig};
use crate::models::{
    Config, ConfigFormat, ConfigMetadata, FirmwareConfig, PostConfig, SessionConfig,
    SignatureConfig, WatchConfig,
};
use crate::util::parse_duration;
use crate::validation::{self, ConfigWarnings};

pub use error::ConfigLoadError;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("ztpconfig.yaml"),
        PathBuf::from("ztpconfig.yml"),
        PathBuf::from("ztpconfig.toml"),
        PathBuf::from("config/ztpconfig.yaml"),
        PathBuf::from("config/ztpconfig.toml"),
    ]
});

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_PLATFORM: &str = "cisco_ios";
const DEFAULT_FLASH_FS: &str = "flash";
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, then the config file, then apply environment overrides
    /// and guard rails.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        self.load_from(EnvConfig::gather(), env_file_loaded)
    }

    /// Load against an explicit environment snapshot. No `.env` file is read
    /// and the process environment is not consulted.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        self.load_from(env, false)
    }

    fn load_from(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path, format) = self.load_file_config(&env)?;
        let metadata = ConfigMetadata {
            config_path,
            format,
            env_file_loaded,
        };
        let (config, warnings) = compose_config(file_config, env, metadata)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>, Option<ConfigFormat>), ConfigLoadError>
    {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(path) => path.clone(),
                None => return Ok((None, None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let (file_config, format) = parse_file(&path, &contents)?;
        Ok((Some(file_config), Some(path), Some(format)))
    }
}

fn parse_file(path: &Path, contents: &str) -> Result<(FileConfig, ConfigFormat), ConfigLoadError> {
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ConfigFormat::from_extension);

    let parse_err = |format: ConfigFormat, message: String| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        format: format.as_str(),
        message,
    };

    match format {
        Some(ConfigFormat::Yaml) => parse_yaml(contents)
            .map(|file| (file, ConfigFormat::Yaml))
            .map_err(|message| parse_err(ConfigFormat::Yaml, message)),
        Some(ConfigFormat::Toml) => toml::from_str(contents)
            .map(|file| (file, ConfigFormat::Toml))
            .map_err(|err| parse_err(ConfigFormat::Toml, err.to_string())),
        Some(ConfigFormat::Json) => serde_json::from_str(contents)
            .map(|file| (file, ConfigFormat::Json))
            .map_err(|err| parse_err(ConfigFormat::Json, err.to_string())),
        None => match parse_yaml(contents) {
            Ok(file) => Ok((file, ConfigFormat::Yaml)),
            Err(yaml_err) => toml::from_str(contents)
                .map(|file| (file, ConfigFormat::Toml))
                .map_err(|toml_err| {
                    parse_err(
                        ConfigFormat::Yaml,
                        format!("{yaml_err}; also not valid toml: {toml_err}"),
                    )
                }),
        },
    }
}

/// An empty YAML document is an empty config, not an error.
fn parse_yaml(contents: &str) -> Result<FileConfig, String> {
    if contents.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(contents).map_err(|err| err.to_string())
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No ztpconfig file detected; using environment variables only",
            "Create ztpconfig.yaml or pass --config <PATH>",
        );
    }

    let file = file_config.unwrap_or_default();
    let mut missing = Vec::new();

    let watch_dir = required(env.watch_dir.or(file.watch_dir), "watch_dir", &mut missing);
    let logfile = required(env.logfile.or(file.logfile), "logfile", &mut missing);
    let tftp_address = required(env.tftpaddr.or(file.tftpaddr), "tftpaddr", &mut missing);
    let image_file = required(env.imgfile.or(file.imgfile), "imgfile", &mut missing);
    let username = required(env.username.or(file.username), "username", &mut missing);
    let password = required(env.password.or(file.password), "password", &mut missing);

    let (
        Some(watch_dir),
        Some(logfile),
        Some(tftp_address),
        Some(image_file),
        Some(username),
        Some(password),
    ) = (watch_dir, logfile, tftp_address, image_file, username, password)
    else {
        return Err(ConfigLoadError::MissingKey { keys: missing });
    };

    let resolution = match env.ssh_method.or(file.ssh_method) {
        Some(raw) => raw
            .parse::<ResolutionMode>()
            .map_err(|err| ConfigLoadError::InvalidValue {
                key: "ssh_method",
                value: raw.clone(),
                reason: err.to_string(),
            })?,
        None => ResolutionMode::default(),
    };

    let probe_defaults = ProbeSettings::default();
    let probe = ProbeSettings {
        initial_wait: duration(
            env.initial_wait,
            "ZTP_INITIAL_WAIT",
            file.initial_wait,
            "initial_wait",
            probe_defaults.initial_wait,
        )?,
        retry_wait: duration(
            env.retry_wait,
            "ZTP_RETRY_WAIT",
            file.retry_wait,
            "retry_wait",
            probe_defaults.retry_wait,
        )?,
        timeout: duration(
            env.timeout,
            "ZTP_TIMEOUT",
            file.timeout,
            "timeout",
            probe_defaults.timeout,
        )?,
        max_attempts: match env.max_attempts {
            Some(raw) => number(&raw, "ZTP_MAX_ATTEMPTS")?,
            None => file.max_attempts.unwrap_or(probe_defaults.max_attempts),
        },
    };

    let session = SessionConfig {
        port: match env.ssh_port {
            Some(raw) => number(&raw, "ZTP_SSH_PORT")?,
            None => file.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
        },
        platform: non_empty(file.platform).unwrap_or_else(|| DEFAULT_PLATFORM.to_string()),
        command_timeout: duration(
            None,
            "",
            file.command_timeout,
            "command_timeout",
            DEFAULT_COMMAND_TIMEOUT,
        )?,
        transfer_timeout: duration(
            None,
            "",
            file.transfer_timeout,
            "transfer_timeout",
            DEFAULT_TRANSFER_TIMEOUT,
        )?,
    };

    let watch = WatchConfig {
        dir: watch_dir,
        resolution,
        ignore_patterns: env
            .ignore_patterns
            .or(file.ignore_patterns)
            .unwrap_or_else(default_ignore_patterns),
        settle_delay: duration(
            None,
            "",
            file.settle_delay,
            "settle_delay",
            DEFAULT_SETTLE_DELAY,
        )?,
        shutdown_grace: duration(
            None,
            "",
            file.shutdown_grace,
            "shutdown_grace",
            DEFAULT_SHUTDOWN_GRACE,
        )?,
    };

    let firmware = FirmwareConfig {
        tftp_address: tftp_address.trim().to_string(),
        image_file: image_file.trim().to_string(),
        flash_fs: non_empty(file.flash_fs)
            .map(|fs| fs.trim_end_matches(':').to_string())
            .unwrap_or_else(|| DEFAULT_FLASH_FS.to_string()),
    };

    let post_config = match env.post_config_file.or(file.post_config_file) {
        Some(path) => read_post_config(path, &mut warnings),
        None => None,
    };

    let config = Config {
        watch,
        logfile,
        firmware,
        credentials: Credentials::new(username, password),
        post_config,
        archive_path: non_empty(env.archive_path.or(file.archive_path)),
        probe,
        session,
        device_log: env.device_log.or(file.device_log).unwrap_or(true),
        signatures: SignatureConfig {
            prompt: file.prompt_signatures.unwrap_or_default(),
            error: file.error_signatures.unwrap_or_default(),
        },
        metadata,
    };

    let guard_warnings = validation::apply_guard_rails(&config)?;
    warnings.extend(guard_warnings);

    Ok((config, warnings))
}

trait Blank {
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Blank for PathBuf {
    fn is_blank(&self) -> bool {
        self.as_os_str().is_empty()
    }
}

fn required<T: Blank>(
    value: Option<T>,
    key: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<T> {
    let value = value.filter(|value| !value.is_blank());
    if value.is_none() {
        missing.push(key);
    }
    value
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_blank())
}

fn duration(
    env_raw: Option<String>,
    env_key: &'static str,
    file_value: Option<DurationValue>,
    file_key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    if let Some(raw) = env_raw {
        return parse_duration(&raw).map_err(|reason| ConfigLoadError::InvalidValue {
            key: env_key,
            value: raw.clone(),
            reason,
        });
    }
    match file_value {
        Some(value) => value
            .to_duration()
            .map_err(|reason| ConfigLoadError::InvalidValue {
                key: file_key,
                value: value.raw(),
                reason,
            }),
        None => Ok(default),
    }
}

fn number<T: std::str::FromStr>(raw: &str, key: &'static str) -> Result<T, ConfigLoadError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err: T::Err| ConfigLoadError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

/// A missing or unreadable post-config file degrades to "no post-config".
fn read_post_config(path: PathBuf, warnings: &mut ConfigWarnings) -> Option<PostConfig> {
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            warnings.push_with_hint(
                format!("post_config_file {} unreadable: {err}", path.display()),
                "Continuing without post-provisioning configuration",
            );
            return None;
        }
    };

    let lines: Vec<String> = contents
        .lines()
        .map(str::trim_end)
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && trimmed != "!"
        })
        .map(str::to_string)
        .collect();

    if lines.is_empty() {
        warnings.push(format!(
            "post_config_file {} has no configuration lines",
            path.display()
        ));
        return None;
    }

    Some(PostConfig { path, lines })
}
