use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use tempfile::{TempDir, tempdir};
use ztp_config::{
    ConfigFormat, ConfigGuardRailError, ConfigLoadError, ConfigLoader, EnvConfig,
};
use ztp_core::trigger::ResolutionMode;

static ENV_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

const ENV_KEYS: &[&str] = &[
    "ZTP_CONFIG",
    "ZTP_WATCH_DIR",
    "ZTP_LOGFILE",
    "ZTP_SSH_METHOD",
    "ZTP_TFTP_ADDR",
    "ZTP_IMAGE_FILE",
    "ZTP_USERNAME",
    "ZTP_PASSWORD",
    "ZTP_POST_CONFIG_FILE",
    "ZTP_ARCHIVE_PATH",
    "ZTP_SSH_PORT",
    "ZTP_INITIAL_WAIT",
    "ZTP_RETRY_WAIT",
    "ZTP_TIMEOUT",
    "ZTP_MAX_ATTEMPTS",
    "ZTP_DEVICE_LOG",
    "ZTP_IGNORE_PATTERNS",
];

fn clear_ztp_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("ztp")).expect("watch dir");
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn watch_dir(&self) -> PathBuf {
        self.path().join("ztp")
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    }

    fn full_yaml(&self) -> String {
        format!(
            "watch_dir: {watch}\n\
             logfile: {log}\n\
             ssh_method: ip\n\
             tftpaddr: 10.0.0.1\n\
             imgfile: c2960x-universalk9-mz.152-7.E9.bin\n\
             username: admin\n\
             password: hunter2\n",
            watch = self.watch_dir().display(),
            log = self.path().join("ztp.log").display(),
        )
    }
}

fn load(path: &Path, env: EnvConfig) -> Result<ztp_config::ConfigLoad, ConfigLoadError> {
    ConfigLoader::new().with_config_path(path).load_with_env(env)
}

#[test]
fn yaml_file_supplies_required_keys_and_defaults() {
    let ws = Workspace::new();
    let path = ws.write("ztpconfig.yaml", &ws.full_yaml());

    let load = load(&path, EnvConfig::default()).expect("config loads");
    let config = load.config;

    assert_eq!(config.watch.dir, ws.watch_dir());
    assert_eq!(config.watch.resolution, ResolutionMode::ByAddress);
    assert_eq!(config.firmware.tftp_address, "10.0.0.1");
    assert_eq!(config.firmware.image_file, "c2960x-universalk9-mz.152-7.E9.bin");
    assert_eq!(config.firmware.flash_fs, "flash");
    assert_eq!(config.credentials.username, "admin");
    assert_eq!(config.credentials.password(), "hunter2");
    assert_eq!(config.probe.initial_wait, Duration::from_secs(30));
    assert_eq!(config.probe.retry_wait, Duration::from_secs(10));
    assert_eq!(config.probe.timeout, Duration::from_secs(5));
    assert_eq!(config.probe.max_attempts, 30);
    assert_eq!(config.session.port, 22);
    assert_eq!(config.session.transfer_timeout, Duration::from_secs(1800));
    assert!(config.device_log);
    assert!(config.post_config.is_none());
    assert!(config.archive_path.is_none());
    assert_eq!(config.metadata.format, Some(ConfigFormat::Yaml));
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert!(load.warnings.is_empty(), "unexpected warnings: {:?}", load.warnings);
}

#[test]
fn toml_and_json_files_are_accepted() {
    let ws = Workspace::new();
    let watch = ws.watch_dir();
    let log = ws.path().join("ztp.log");

    let toml_path = ws.write(
        "ztpconfig.toml",
        &format!(
            "watch_dir = \"{}\"\nlogfile = \"{}\"\ntftpaddr = \"10.0.0.1\"\n\
             imgfile = \"img.bin\"\nusername = \"admin\"\npassword = \"pw\"\n\
             ssh_method = \"dns\"\nretry_wait = \"15s\"\n",
            watch.display(),
            log.display()
        ),
    );
    let config = load(&toml_path, EnvConfig::default()).expect("toml loads").config;
    assert_eq!(config.metadata.format, Some(ConfigFormat::Toml));
    assert_eq!(config.watch.resolution, ResolutionMode::ByHostname);
    assert_eq!(config.probe.retry_wait, Duration::from_secs(15));

    let json_path = ws.write(
        "ztpconfig.json",
        &format!(
            r#"{{"watch_dir": "{}", "logfile": "{}", "tftpaddr": "10.0.0.1",
                "imgfile": "img.bin", "username": "admin", "password": "pw",
                "ssh_method": "parse", "max_attempts": 12}}"#,
            watch.display(),
            log.display()
        ),
    );
    let config = load(&json_path, EnvConfig::default()).expect("json loads").config;
    assert_eq!(config.metadata.format, Some(ConfigFormat::Json));
    assert_eq!(config.watch.resolution, ResolutionMode::ByParsedAddress);
    assert_eq!(config.probe.max_attempts, 12);
}

#[test]
fn missing_required_keys_are_reported_together() {
    let ws = Workspace::new();
    let path = ws.write("ztpconfig.yaml", "tftpaddr: 10.0.0.1\nusername: admin\n");

    let err = load(&path, EnvConfig::default()).expect_err("keys missing");
    match &err {
        ConfigLoadError::MissingKey { keys } => {
            assert_eq!(keys, &vec!["watch_dir", "logfile", "imgfile", "password"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("watch_dir, logfile, imgfile, password"));
}

#[test]
fn explicit_path_that_does_not_exist_is_an_error() {
    let ws = Workspace::new();
    let err = load(&ws.path().join("nope.yaml"), EnvConfig::default()).expect_err("missing");
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn environment_overrides_file_values() {
    let ws = Workspace::new();
    let path = ws.write("ztpconfig.yaml", &ws.full_yaml());

    let env = EnvConfig {
        tftpaddr: Some("192.0.2.50".into()),
        password: Some("from-env".into()),
        ssh_method: Some("parse".into()),
        max_attempts: Some("3".into()),
        initial_wait: Some("2m".into()),
        ssh_port: Some("2222".into()),
        device_log: Some(false),
        ..EnvConfig::default()
    };

    let config = load(&path, env).expect("config loads").config;
    assert_eq!(config.firmware.tftp_address, "192.0.2.50");
    assert_eq!(config.credentials.password(), "from-env");
    assert_eq!(config.watch.resolution, ResolutionMode::ByParsedAddress);
    assert_eq!(config.probe.max_attempts, 3);
    assert_eq!(config.probe.initial_wait, Duration::from_secs(120));
    assert_eq!(config.session.port, 2222);
    assert!(!config.device_log);
    assert_eq!(config.credentials.username, "admin");
}

#[test]
fn malformed_values_name_their_source() {
    let ws = Workspace::new();
    let path = ws.write("ztpconfig.yaml", &ws.full_yaml());

    let env = EnvConfig {
        max_attempts: Some("many".into()),
        ..EnvConfig::default()
    };
    let err = load(&path, env).expect_err("bad number");
    assert!(matches!(
        err,
        ConfigLoadError::InvalidValue { key: "ZTP_MAX_ATTEMPTS", .. }
    ));

    let env = EnvConfig {
        ssh_method: Some("telnet".into()),
        ..EnvConfig::default()
    };
    let err = load(&path, env).expect_err("bad method");
    assert!(matches!(err, ConfigLoadError::InvalidValue { key: "ssh_method", .. }));

    let bad_duration = ws.write(
        "bad-duration.yaml",
        &format!("{}retry_wait: soon\n", ws.full_yaml()),
    );
    let err = load(&bad_duration, EnvConfig::default()).expect_err("bad duration");
    assert!(matches!(err, ConfigLoadError::InvalidValue { key: "retry_wait", .. }));
}

#[test]
fn post_config_file_is_read_and_comment_lines_dropped() {
    let ws = Workspace::new();
    let post = ws.write(
        "post.cfg",
        "!\nip domain-name example.net\n\n!\nntp server 192.0.2.1\n",
    );
    let path = ws.write(
        "ztpconfig.yaml",
        &format!(
            "{}post_config_file: {}\narchive_path: /backups/\n",
            ws.full_yaml(),
            post.display()
        ),
    );

    let config = load(&path, EnvConfig::default()).expect("config loads").config;
    let post_config = config.post_config.as_ref().expect("post config present");
    assert_eq!(
        post_config.lines,
        vec!["ip domain-name example.net", "ntp server 192.0.2.1"]
    );

    let plan = config.upgrade_plan();
    assert_eq!(plan.post_config.as_ref().map(Vec::len), Some(2));
    assert_eq!(
        plan.archive_command("sw-01").as_deref(),
        Some("copy running-config tftp://10.0.0.1/backups/sw-01.cfg")
    );
}

#[test]
fn unreadable_post_config_degrades_to_a_warning() {
    let ws = Workspace::new();
    let path = ws.write(
        "ztpconfig.yaml",
        &format!(
            "{}post_config_file: {}\n",
            ws.full_yaml(),
            ws.path().join("absent.cfg").display()
        ),
    );

    let load = load(&path, EnvConfig::default()).expect("config still loads");
    assert!(load.config.post_config.is_none());
    assert!(
        load.warnings
            .iter()
            .any(|warning| warning.message.contains("absent.cfg"))
    );
}

#[test]
fn guard_rails_reject_unusable_settings() {
    let ws = Workspace::new();

    let zero_attempts = ws.write(
        "zero.yaml",
        &format!("{}max_attempts: 0\n", ws.full_yaml()),
    );
    let err = load(&zero_attempts, EnvConfig::default()).expect_err("zero attempts");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroAttempts)
    ));

    let env = EnvConfig {
        imgfile: Some("images/c2960x.bin".into()),
        ..EnvConfig::default()
    };
    let path = ws.write("ztpconfig.yaml", &ws.full_yaml());
    let err = load(&path, env).expect_err("image with path");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidImageName(_))
    ));

    let env = EnvConfig {
        watch_dir: Some(ws.path().join("missing")),
        ..EnvConfig::default()
    };
    let err = load(&path, env).expect_err("watch dir missing");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::WatchDirMissing(_))
    ));
}

#[test]
fn short_reachability_budget_is_only_a_warning() {
    let ws = Workspace::new();
    let path = ws.write(
        "ztpconfig.yaml",
        &format!(
            "{}initial_wait: 1\nretry_wait: 1\ntimeout: 1\nmax_attempts: 2\n",
            ws.full_yaml()
        ),
    );

    let load = load(&path, EnvConfig::default()).expect("config loads");
    assert!(
        load.warnings
            .iter()
            .any(|warning| warning.message.contains("reachability budget"))
    );
}

#[test]
fn huge_retry_settings_load_without_a_budget_warning() {
    let ws = Workspace::new();
    let path = ws.write("ztpconfig.yaml", &ws.full_yaml());
    let env = EnvConfig {
        retry_wait: Some("1000years".into()),
        max_attempts: Some("4000000000".into()),
        ..EnvConfig::default()
    };

    let load = load(&path, env).expect("config loads");
    assert_eq!(load.config.probe.max_attempts, 4_000_000_000);
    assert!(
        !load
            .warnings
            .iter()
            .any(|warning| warning.message.contains("reachability budget"))
    );
}

#[test]
fn environment_alone_is_enough_without_a_file() {
    let ws = Workspace::new();
    let env = EnvConfig {
        watch_dir: Some(ws.watch_dir()),
        logfile: Some(ws.path().join("ztp.log")),
        tftpaddr: Some("10.0.0.1".into()),
        imgfile: Some("img.bin".into()),
        username: Some("admin".into()),
        password: Some("pw".into()),
        ..EnvConfig::default()
    };

    let load = ConfigLoader::new().load_with_env(env).expect("env-only config");
    assert!(load.config.metadata.config_path.is_none());
    assert!(
        load.warnings
            .iter()
            .any(|warning| warning.message.contains("No ztpconfig file"))
    );
}

#[test]
fn config_converts_into_core_settings() {
    let ws = Workspace::new();
    let path = ws.write(
        "ztpconfig.yaml",
        &format!(
            "{}ssh_port: 830\nsettle_delay: 3s\nignore_patterns: ['.swp', '.part']\n\
             prompt_signatures: ['proceed with copy']\n",
            ws.full_yaml()
        ),
    );

    let config = load(&path, EnvConfig::default()).expect("config loads").config;

    let trigger = config.trigger_settings();
    assert_eq!(trigger.resolution, ResolutionMode::ByAddress);
    assert_eq!(trigger.ignore_patterns.len(), 2);

    let dispatch = config.dispatch_settings();
    assert_eq!(dispatch.port, 830);
    assert_eq!(dispatch.settle_delay, Duration::from_secs(3));

    let session = config.session_settings();
    assert_eq!(session.port, 830);
    assert_eq!(session.platform, "cisco_ios");

    let classifier = config.classifier();
    assert!(
        classifier
            .rules()
            .iter()
            .any(|rule| rule.needle == "proceed with copy")
    );

    let described = config.describe();
    let password = described
        .iter()
        .find(|(key, _)| *key == "password")
        .map(|(_, value)| value.as_str());
    assert_eq!(password, Some("<redacted>"));
}

#[tokio::test]
async fn env_file_values_fill_gaps_in_the_config_file() {
    let _guard = ENV_LOCK.lock().await;
    clear_ztp_env();

    let ws = Workspace::new();
    let path = ws.write(
        "ztpconfig.yaml",
        &format!(
            "watch_dir: {}\nlogfile: {}\nimgfile: img.bin\nusername: admin\n",
            ws.watch_dir().display(),
            ws.path().join("ztp.log").display()
        ),
    );
    let env_file = ws.write(
        ".env",
        "ZTP_TFTP_ADDR=198.51.100.7\nZTP_PASSWORD=from-dotenv\n",
    );

    let result = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(&env_file)
        .load();
    clear_ztp_env();

    let config = result.expect("config loads").config;
    assert!(config.metadata.env_file_loaded);
    assert_eq!(config.firmware.tftp_address, "198.51.100.7");
    assert_eq!(config.credentials.password(), "from-dotenv");
}

#[tokio::test]
async fn missing_env_file_is_not_an_error() {
    let _guard = ENV_LOCK.lock().await;
    clear_ztp_env();

    let ws = Workspace::new();
    let path = ws.write("ztpconfig.yaml", &ws.full_yaml());

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .with_env_file(ws.path().join("absent.env"))
        .load()
        .expect("config loads")
        .config;
    assert!(!config.metadata.env_file_loaded);
}
