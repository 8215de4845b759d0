//! Trigger directory watcher.
//!
//! A thin wrapper around `notify` that watches one directory (not its
//! subdirectories) and forwards file creations as [`TriggerEvent`]s. The
//! notify callback runs on its own thread and hands events over with
//! `blocking_send`, so a full channel back-pressures the watcher instead of
//! dropping creations.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::event::{CreateKind, EventKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::error::{Result, ZtpError};
use crate::trigger::TriggerEvent;

/// Default capacity of the watcher to dispatcher channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum WatchMessage {
    Created(TriggerEvent),
    Error(String),
}

pub struct TriggerWatcher {
    watch_dir: PathBuf,
    watcher: RecommendedWatcher,
}

impl fmt::Debug for TriggerWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerWatcher")
            .field("watch_dir", &self.watch_dir)
            .field("backend", &std::any::type_name::<RecommendedWatcher>())
            .finish()
    }
}

impl TriggerWatcher {
    /// Start watching `dir`. Events arrive on the returned receiver until the
    /// watcher is dropped or [`TriggerWatcher::stop`] is called.
    pub async fn start(
        dir: impl Into<PathBuf>,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<WatchMessage>)> {
        let watch_dir = absolute(dir.into());
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let root = watch_dir.clone();
        let watcher = spawn_blocking(move || init_watcher(&root, tx))
            .await
            .map_err(|err| ZtpError::Internal(format!("watcher init task failed: {err}")))??;

        info!(watch_dir = %watch_dir.display(), "watching for trigger files");
        Ok((Self { watch_dir, watcher }, rx))
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// Stop delivering events. Already queued messages stay readable.
    pub fn stop(mut self) {
        if let Err(err) = self.watcher.unwatch(&self.watch_dir) {
            debug!(watch_dir = %self.watch_dir.display(), error = %err, "unwatch failed");
        }
        // Dropping the watcher closes the sender half.
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

fn init_watcher(root: &Path, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let label = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                for message in convert_event(&event) {
                    if let Err(err) = tx.blocking_send(message) {
                        warn!(
                            "trigger channel send failed for {}: {}",
                            label.display(),
                            err
                        );
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        ZtpError::Watch(format!(
            "failed to create watcher for {}: {}",
            root.display(),
            err
        ))
    })?;

    watcher
        .watch(root, RecursiveMode::NonRecursive)
        .map_err(|err| ZtpError::Watch(format!("failed to watch {}: {}", root.display(), err)))?;

    Ok(watcher)
}

/// Only creations of non-directory entries are triggers.
fn convert_event(event: &Event) -> Vec<WatchMessage> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|path| !path.is_dir())
            .filter_map(|path| match TriggerEvent::from_path(path.clone()) {
                Ok(trigger) => Some(WatchMessage::Created(trigger)),
                Err(err) => {
                    debug!(error = %err, "ignoring creation without a file name");
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
