//! # ZTP Core
//!
//! Provisioning orchestrator for zero-touch network device upgrades.
//!
//! ## Overview
//!
//! A trigger file named `<hostname>_<address>[_...]` dropped into the watched
//! directory starts one independent workflow for that device:
//!
//! - **Trigger Parser** ([`trigger`]): derives the device identity and picks
//!   the connect target according to the configured resolution mode
//! - **Readiness Prober** ([`probe`]): polls TCP reachability of the
//!   management port with bounded retries
//! - **Device Session** ([`session`]): one authenticated command channel per
//!   workflow, closed exactly once
//! - **Upgrade Sequencer** ([`upgrade`]): image check, conditional transfer,
//!   boot selector, optional post-config and archive, persist, with a
//!   narrative entry per step
//! - **Dispatch Loop** ([`dispatch`]): launches and tracks workflows and
//!   reports their outcome on a completion channel
//!
//! ## Feature Flags
//!
//! - `ssh`: libssh2-backed [`session::SshTransport`]
//! - `fs-watch`: notify-backed [`fs_watch::TriggerWatcher`]
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ztp_core::{
//!     Credentials, DispatchSettings, Dispatcher, ProbeSettings, ReadinessProber, SessionSettings,
//!     SshTransport, TriggerEvent, TriggerParser, TriggerSettings, UpgradePlan, UpgradeSequencer,
//! };
//!
//! # async fn run() {
//! let (dispatcher, mut reports) = Dispatcher::new(
//!     DispatchSettings::default(),
//!     TriggerParser::new(TriggerSettings::default()),
//!     ReadinessProber::tcp(ProbeSettings::default()),
//!     Arc::new(SshTransport::new(SessionSettings::default())),
//!     Credentials::new("admin", "secret"),
//!     UpgradeSequencer::new(Arc::new(UpgradePlan::new("10.0.0.1", "c2960x.bin"))),
//! );
//!
//! let event = TriggerEvent::from_path("/srv/ztp/SW01_10.0.0.5_template.cfg").unwrap();
//! dispatcher.handle_event(event);
//! if let Some(report) = reports.recv().await {
//!     println!("{}", report.summary());
//! }
//! # }
//! ```

pub mod dispatch;
pub mod error;
#[cfg(feature = "fs-watch")]
pub mod fs_watch;
pub mod probe;
pub mod session;
pub mod trigger;
pub mod upgrade;

pub use dispatch::{
    DispatchSettings, Dispatcher, InFlight, ShutdownReport, WorkflowId, WorkflowReport,
    WorkflowStatus,
};
pub use error::{Result, ZtpError};
#[cfg(feature = "fs-watch")]
pub use fs_watch::{TriggerWatcher, WatchMessage};
pub use probe::{Connector, ProbeError, ProbeOutcome, ProbeSettings, ReadinessProber, TcpConnector};
#[cfg(feature = "ssh")]
pub use session::SshTransport;
pub use session::{
    Credentials, DeviceSession, DeviceTransport, SessionError, SessionSettings, SessionTarget,
};
pub use trigger::{
    DeviceIdentity, ResolutionMode, TriggerError, TriggerEvent, TriggerParser, TriggerSettings,
};
pub use upgrade::{
    AbortReason, Narrative, NarrativeEntry, OutputClassifier, Severity, Step, TransferOutcome,
    UpgradeOutcome, UpgradePlan, UpgradeReport, UpgradeSequencer,
};
