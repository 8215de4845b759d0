//! # ZTP Watcher
//!
//! Watches the TFTP server's drop directory for the trigger files devices
//! upload at the end of zero-touch bootstrap, then provisions each device
//! over SSH: firmware check and copy, boot statement, optional post-config,
//! optional config archive, and `write memory`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};
use ztp_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions, ConfigWarnings};
use ztp_core::fs_watch::DEFAULT_CHANNEL_CAPACITY;
use ztp_core::{
    Dispatcher, ReadinessProber, SshTransport, TriggerParser, TriggerWatcher, UpgradeSequencer,
    WatchMessage, WorkflowReport,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "ztp-watcher")]
#[command(about = "Provision network devices as they complete zero-touch bootstrap")]
struct Cli {
    /// Path to the ztpconfig file (YAML, TOML or JSON)
    #[arg(short, long, env = "ZTP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before the environment is read
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate configuration, print the effective settings, and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config,
        env_file: cli.env_file,
    })
    .load()
    .context("failed to load configuration")?;

    match cli.command {
        Some(Command::Check) => {
            print_check(&config, &warnings);
            Ok(())
        }
        None => {
            init_tracing(&config)?;
            log_config(&config, &warnings);
            run(Arc::new(config)).await
        }
    }
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.logfile)
        .with_context(|| format!("failed to open logfile {}", config.logfile.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(logfile)),
        )
        .init();
    Ok(())
}

fn log_config(config: &Config, warnings: &ConfigWarnings) {
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    match (&config.metadata.config_path, config.metadata.format) {
        (Some(path), Some(format)) => {
            info!(path = %path.display(), format = format.as_str(), "configuration file loaded")
        }
        _ => info!("configuration taken from environment only"),
    }

    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    info!(
        watch_dir = %config.watch.dir.display(),
        ssh_method = %config.watch.resolution,
        tftpaddr = %config.firmware.tftp_address,
        imgfile = %config.firmware.image_file,
        post_config = config.post_config.is_some(),
        archive = config.archive_path.is_some(),
        max_attempts = config.probe.max_attempts,
        "provisioning configuration in effect"
    );
}

fn print_check(config: &Config, warnings: &ConfigWarnings) {
    match &config.metadata.config_path {
        Some(path) => println!("config file: {}", path.display()),
        None => println!("config file: (none, environment only)"),
    }

    let described = config.describe();
    let width = described.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in &described {
        println!("  {key:<width$}  {value}");
    }

    if warnings.is_empty() {
        println!("configuration OK");
    } else {
        println!("configuration OK with {} warning(s):", warnings.len());
        for warning in warnings.iter() {
            match &warning.hint {
                Some(hint) => println!("  - {} ({hint})", warning.message),
                None => println!("  - {}", warning.message),
            }
        }
    }
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let (dispatcher, mut reports) = Dispatcher::new(
        config.dispatch_settings(),
        TriggerParser::new(config.trigger_settings()),
        ReadinessProber::tcp(config.probe_settings()),
        Arc::new(SshTransport::new(config.session_settings())),
        config.credentials.clone(),
        UpgradeSequencer::new(config.upgrade_plan()),
    );

    let (watcher, mut events) =
        TriggerWatcher::start(config.watch.dir.clone(), DEFAULT_CHANNEL_CAPACITY)
            .await
            .context("failed to watch trigger directory")?;

    loop {
        tokio::select! {
            message = events.recv() => match message {
                Some(WatchMessage::Created(event)) => {
                    dispatcher.handle_event(event);
                }
                Some(WatchMessage::Error(err)) => warn!(error = %err, "watch error"),
                None => {
                    error!("trigger watcher stopped delivering events");
                    break;
                }
            },
            Some(report) = reports.recv() => log_report(&report),
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(error = %err, "failed to listen for interrupt");
                }
                info!("interrupt received; no longer accepting triggers");
                break;
            }
        }
    }

    watcher.stop();

    let grace = dispatcher.settings().shutdown_grace;
    if dispatcher.in_flight_count() > 0 {
        info!(
            in_flight = dispatcher.in_flight_count(),
            grace = %humantime::format_duration(grace),
            "waiting for in-flight workflows; interrupt again to stop waiting"
        );
    }

    let shutdown = dispatcher.shutdown(grace);
    tokio::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            outcome = &mut shutdown => break outcome,
            Some(report) = reports.recv() => log_report(&report),
            _ = tokio::signal::ctrl_c() => {
                warn!("second interrupt; not waiting for in-flight workflows");
                break dispatcher.abandon();
            }
        }
    };

    while let Ok(report) = reports.try_recv() {
        log_report(&report);
    }

    if outcome.is_clean() {
        info!("ztp watcher stopped");
    } else {
        warn!(
            abandoned = outcome.abandoned.len(),
            "ztp watcher stopped with workflows still running"
        );
    }
    Ok(())
}

fn log_report(report: &WorkflowReport) {
    if report.status.is_success() {
        info!(workflow_id = %report.id, hostname = %report.hostname, "{}", report.summary());
    } else {
        warn!(workflow_id = %report.id, hostname = %report.hostname, "{}", report.summary());
    }
}
