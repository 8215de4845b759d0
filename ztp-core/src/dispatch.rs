//! Dispatch loop: one independent unit of work per accepted trigger.
//!
//! [`Dispatcher::handle_event`] filters and name-parses a trigger on the
//! caller's task, registers the workflow and returns immediately. The unit of
//! work then runs Resolve → Probe → Session open → Upgrade sequence on a
//! [`TaskTracker`] and reports through the completion channel. Workflows
//! never share mutable state; the in-flight registry exists only so shutdown
//! can enumerate what is still running.
//!
//! No concurrency cap is applied. Trigger files are operator-placed, one per
//! device being commissioned, so the number of simultaneous workflows is
//! bounded by how many devices are racked at once.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::probe::{ProbeOutcome, ReadinessProber};
use crate::session::{Credentials, DeviceTransport, SessionTarget};
use crate::trigger::{TriggerError, TriggerEvent, TriggerName, TriggerParser};
use crate::upgrade::{
    AbortReason, Narrative, Step, TransferOutcome, UpgradeOutcome, UpgradeReport, UpgradeSequencer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Wait before reading a trigger file's body in `parse` mode.
    pub settle_delay: Duration,
    /// Management port probed and used for the session.
    pub port: u16,
    pub platform: String,
    /// How long shutdown waits for in-flight workflows.
    pub shutdown_grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            port: 22,
            platform: "cisco_ios".to_string(),
            shutdown_grace: Duration::from_secs(10 * 60),
        }
    }
}

/// Registry entry for a running workflow.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub hostname: String,
    pub file_name: String,
    pub connect_target: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Provisioned,
    Aborted(AbortReason),
    Unreachable { attempts: u32, last_error: String },
    SessionFailed(String),
    /// Trigger could not be resolved to a connect target.
    Rejected(String),
    /// Unclassified failure caught at the unit-of-work boundary.
    Panicked(String),
}

impl WorkflowStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkflowStatus::Provisioned)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Provisioned => f.write_str("provisioned"),
            WorkflowStatus::Aborted(reason) => write!(f, "aborted: {reason}"),
            WorkflowStatus::Unreachable {
                attempts,
                last_error,
            } => write!(f, "unreachable after {attempts} attempts: {last_error}"),
            WorkflowStatus::SessionFailed(reason) => write!(f, "session failed: {reason}"),
            WorkflowStatus::Rejected(reason) => write!(f, "rejected: {reason}"),
            WorkflowStatus::Panicked(reason) => write!(f, "workflow panicked: {reason}"),
        }
    }
}

/// Sent on the completion channel once per launched workflow.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub id: WorkflowId,
    pub file_name: String,
    pub hostname: String,
    pub status: WorkflowStatus,
    pub transfer: Option<TransferOutcome>,
    pub transfer_duration: Option<Duration>,
    pub narrative: Narrative,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowReport {
    fn new(
        id: WorkflowId,
        file_name: String,
        started_at: DateTime<Utc>,
        status: WorkflowStatus,
        narrative: Narrative,
    ) -> Self {
        Self {
            id,
            file_name,
            hostname: narrative.hostname().to_string(),
            status,
            transfer: None,
            transfer_duration: None,
            narrative,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn from_upgrade(
        id: WorkflowId,
        file_name: String,
        started_at: DateTime<Utc>,
        report: UpgradeReport,
    ) -> Self {
        let status = match report.outcome {
            UpgradeOutcome::Provisioned => WorkflowStatus::Provisioned,
            UpgradeOutcome::Aborted(reason) => WorkflowStatus::Aborted(reason),
        };
        Self {
            id,
            file_name,
            hostname: report.hostname,
            status,
            transfer: report.transfer,
            transfer_duration: report.transfer_duration,
            narrative: report.narrative,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// One-line summary for the run loop's log.
    pub fn summary(&self) -> String {
        let elapsed = (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs();
        match &self.transfer {
            Some(transfer) => format!(
                "{} ({}): {} [transfer {}] in {}s",
                self.hostname, self.file_name, self.status, transfer, elapsed
            ),
            None => format!(
                "{} ({}): {} in {}s",
                self.hostname, self.file_name, self.status, elapsed
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Workflows still running when the wait ended.
    pub abandoned: Vec<(WorkflowId, InFlight)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Read-only collaborators shared by every unit of work.
struct Shared {
    settings: DispatchSettings,
    parser: TriggerParser,
    prober: ReadinessProber,
    transport: Arc<dyn DeviceTransport>,
    credentials: Credentials,
    sequencer: UpgradeSequencer,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    in_flight: Arc<DashMap<WorkflowId, InFlight>>,
    completions: mpsc::UnboundedSender<WorkflowReport>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.shared.settings)
            .field("resolution", &self.shared.parser.resolution())
            .field(
                "transport",
                &std::any::type_name_of_val(self.shared.transport.as_ref()),
            )
            .field("in_flight", &self.in_flight.len())
            .field("accepting", &!self.tracker.is_closed())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        settings: DispatchSettings,
        parser: TriggerParser,
        prober: ReadinessProber,
        transport: Arc<dyn DeviceTransport>,
        credentials: Credentials,
        sequencer: UpgradeSequencer,
    ) -> (Self, mpsc::UnboundedReceiver<WorkflowReport>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            shared: Arc::new(Shared {
                settings,
                parser,
                prober,
                transport,
                credentials,
                sequencer,
            }),
            tracker: TaskTracker::new(),
            in_flight: Arc::new(DashMap::new()),
            completions,
        };
        (dispatcher, rx)
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.shared.settings
    }

    pub fn is_accepting(&self) -> bool {
        !self.tracker.is_closed()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot of running workflows, oldest first.
    pub fn in_flight(&self) -> Vec<(WorkflowId, InFlight)> {
        let mut entries: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.started_at);
        entries
    }

    /// Accept a trigger and launch its workflow. Returns `None` when the
    /// trigger is ignored, malformed, or arrives after shutdown began.
    pub fn handle_event(&self, event: TriggerEvent) -> Option<WorkflowId> {
        if self.tracker.is_closed() {
            warn!(file = %event.file_name, "shutting down; trigger not accepted");
            return None;
        }
        if self.shared.parser.is_ignored(&event) {
            debug!(file = %event.file_name, "ignoring trigger matching an ignore pattern");
            return None;
        }
        let name = match self.shared.parser.parse_name(&event) {
            Ok(name) => name,
            Err(err) => {
                warn!(file = %event.file_name, error = %err, "trigger rejected");
                return None;
            }
        };

        let id = WorkflowId::new();
        let started_at = Utc::now();
        self.in_flight.insert(
            id,
            InFlight {
                hostname: name.hostname.clone(),
                file_name: event.file_name.clone(),
                connect_target: None,
                started_at,
            },
        );
        info!(
            workflow_id = %id,
            hostname = %name.hostname,
            file = %event.file_name,
            "workflow started"
        );

        let shared = Arc::clone(&self.shared);
        let in_flight = Arc::clone(&self.in_flight);
        let completions = self.completions.clone();
        self.tracker.spawn(async move {
            let file_name = event.file_name.clone();
            let hostname = name.hostname.clone();
            let unit = run_workflow(&shared, &in_flight, id, started_at, event, name);

            let report = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(report) => report,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(
                        workflow_id = %id,
                        hostname = %hostname,
                        reason = %reason,
                        "workflow panicked"
                    );
                    let mut narrative = Narrative::new(hostname);
                    narrative.warn(Step::Abort, format!("Workflow failed unexpectedly: {reason}"));
                    WorkflowReport::new(
                        id,
                        file_name,
                        started_at,
                        WorkflowStatus::Panicked(reason),
                        narrative,
                    )
                }
            };

            in_flight.remove(&id);
            if completions.send(report).is_err() {
                debug!(workflow_id = %id, "completion receiver dropped");
            }
        });

        Some(id)
    }

    /// Stop accepting triggers and wait up to `grace` for running workflows.
    /// Workflows are never cancelled; whatever is still running afterwards
    /// is reported as abandoned.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.tracker.close();
        let running = self.in_flight();
        if running.is_empty() {
            return ShutdownReport::default();
        }

        for (id, entry) in &running {
            info!(
                workflow_id = %id,
                hostname = %entry.hostname,
                file = %entry.file_name,
                since = %entry.started_at,
                "waiting for in-flight workflow"
            );
        }

        match timeout(grace, self.tracker.wait()).await {
            Ok(()) => ShutdownReport::default(),
            Err(_) => self.abandon(),
        }
    }

    /// Stop accepting triggers and report everything still running as
    /// abandoned without waiting.
    pub fn abandon(&self) -> ShutdownReport {
        self.tracker.close();
        let abandoned = self.in_flight();
        for (id, entry) in &abandoned {
            warn!(
                workflow_id = %id,
                hostname = %entry.hostname,
                file = %entry.file_name,
                "abandoning in-flight workflow"
            );
        }
        ShutdownReport { abandoned }
    }
}

async fn run_workflow(
    shared: &Shared,
    in_flight: &DashMap<WorkflowId, InFlight>,
    id: WorkflowId,
    started_at: DateTime<Utc>,
    event: TriggerEvent,
    name: TriggerName,
) -> WorkflowReport {
    let file_name = event.file_name.clone();
    let mut narrative = Narrative::new(name.hostname.clone());
    narrative.record(Step::Detect, format!("File created: {}", event.path().display()));

    let resolved = match read_content(shared, &event).await {
        Ok(content) => shared.parser.resolve(&event, name, content.as_deref()),
        Err(err) => Err(err),
    };
    let identity = match resolved {
        Ok(identity) => identity,
        Err(err) => {
            narrative.warn(Step::Resolve, format!("Trigger rejected: {err}"));
            return WorkflowReport::new(
                id,
                file_name,
                started_at,
                WorkflowStatus::Rejected(err.to_string()),
                narrative,
            );
        }
    };

    if let Some(mut entry) = in_flight.get_mut(&id) {
        entry.connect_target = Some(identity.connect_target.clone());
    }

    let port = shared.settings.port;
    match shared.prober.probe(&identity.connect_target, port).await {
        ProbeOutcome::Reachable { attempts } => narrative.record(
            Step::Probe,
            format!(
                "{} reachable on port {port} after {attempts} attempt(s)",
                identity.connect_target
            ),
        ),
        ProbeOutcome::Exhausted {
            attempts,
            last_error,
        } => {
            narrative.warn(
                Step::Probe,
                format!(
                    "{} unreachable on port {port} after {attempts} attempts: {last_error}",
                    identity.connect_target
                ),
            );
            return WorkflowReport::new(
                id,
                file_name,
                started_at,
                WorkflowStatus::Unreachable {
                    attempts,
                    last_error,
                },
                narrative,
            );
        }
    }

    let target = SessionTarget {
        hostname: identity.hostname.clone(),
        address: identity.connect_target.clone(),
        port,
        platform: shared.settings.platform.clone(),
    };
    let session = match shared.transport.open(&target, &shared.credentials).await {
        Ok(session) => session,
        Err(err) => {
            narrative.warn(Step::Connect, format!("Session open failed: {err}"));
            return WorkflowReport::new(
                id,
                file_name,
                started_at,
                WorkflowStatus::SessionFailed(err.to_string()),
                narrative,
            );
        }
    };

    let report = shared.sequencer.run(identity, session, narrative).await;
    WorkflowReport::from_upgrade(id, file_name, started_at, report)
}

/// Trigger body for `parse` mode, read after the settle delay.
async fn read_content(
    shared: &Shared,
    event: &TriggerEvent,
) -> Result<Option<String>, TriggerError> {
    if !shared.parser.resolution().needs_content() {
        return Ok(None);
    }
    sleep(shared.settings.settle_delay).await;
    tokio::fs::read_to_string(event.path())
        .await
        .map(Some)
        .map_err(|err| TriggerError::Unreadable {
            path: event.raw_path.clone(),
            reason: err.to_string(),
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_ids_are_unique() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn status_display_names_the_reason() {
        let status = WorkflowStatus::Unreachable {
            attempts: 30,
            last_error: "connect timed out after 5s".into(),
        };
        assert_eq!(
            status.to_string(),
            "unreachable after 30 attempts: connect timed out after 5s"
        );
        assert!(WorkflowStatus::Provisioned.is_success());
        assert!(!WorkflowStatus::Aborted(AbortReason::PromptBlocked).is_success());
    }
}
