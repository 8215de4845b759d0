#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ztp_core::probe::{Connector, ProbeError, ProbeSettings, ReadinessProber};
use ztp_core::session::{
    Credentials, DeviceSession, DeviceTransport, SessionError, SessionTarget,
};
use ztp_core::trigger::{ResolutionMode, TriggerEvent, TriggerParser, TriggerSettings};
use ztp_core::upgrade::{UpgradePlan, UpgradeSequencer};
use ztp_core::{DispatchSettings, Dispatcher, WorkflowReport};

pub const IMAGE: &str = "c2960x-universalk9-mz.152-7.E4.bin";
pub const TFTP: &str = "10.0.0.1";

pub const MISSING_LISTING: &str =
    "%Error opening flash:/c2960x-universalk9-mz.152-7.E4.bin (No such file or directory)";
pub const PRESENT_LISTING: &str = concat!(
    "Directory of flash:/c2960x-universalk9-mz.152-7.E4.bin\n\n",
    "    2  -rwx  26789376  Mar 1 1993 00:12:41 +00:00  c2960x-universalk9-mz.152-7.E4.bin",
);
pub const TRANSFER_OK: &str = concat!(
    "Accessing tftp://10.0.0.1/c2960x-universalk9-mz.152-7.E4.bin...\n",
    "Loading c2960x-universalk9-mz.152-7.E4.bin from 10.0.0.1 (via Vlan1): !!!!!!!!!!\n",
    "[OK - 26789376 bytes]\n\n",
    "26789376 bytes copied in 40.112 secs (667864 bytes/sec)",
);

/// Accepts from the configured attempt onwards; `None` never accepts.
pub struct FakeConnector {
    accept_on: Option<u32>,
    pub targets: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn accepting_on(attempt: u32) -> Arc<Self> {
        Arc::new(Self {
            accept_on: Some(attempt),
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn never() -> Arc<Self> {
        Arc::new(Self {
            accept_on: None,
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.targets.lock().len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        target: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<(), ProbeError> {
        let mut targets = self.targets.lock();
        targets.push(target.to_string());
        match self.accept_on {
            Some(n) if targets.len() as u32 >= n => Ok(()),
            _ => Err(ProbeError::Connect("connection refused".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Exec(String),
    Config(Vec<String>),
}

#[derive(Clone)]
enum Reply {
    Output(String),
    Fail(SessionError),
    Panic,
}

/// Canned device behaviour keyed by command prefix. Later rules win;
/// unmatched commands return empty output.
#[derive(Clone, Default)]
pub struct DeviceScript {
    replies: Vec<(String, Reply)>,
    delays: Vec<(String, Duration)>,
}

impl DeviceScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, prefix: &str, output: &str) -> Self {
        self.replies
            .push((prefix.to_string(), Reply::Output(output.to_string())));
        self
    }

    pub fn fail(mut self, prefix: &str, err: SessionError) -> Self {
        self.replies.push((prefix.to_string(), Reply::Fail(err)));
        self
    }

    pub fn panic_on(mut self, prefix: &str) -> Self {
        self.replies.push((prefix.to_string(), Reply::Panic));
        self
    }

    pub fn delay(mut self, prefix: &str, delay: Duration) -> Self {
        self.delays.push((prefix.to_string(), delay));
        self
    }

    fn reply(&self, command: &str) -> Reply {
        self.replies
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Reply::Output(String::new()))
    }

    fn delay_for(&self, command: &str) -> Option<Duration> {
        self.delays
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, delay)| *delay)
    }
}

/// Everything the fake devices saw, across all sessions.
#[derive(Default)]
pub struct DeviceLog {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub targets: Mutex<Vec<SessionTarget>>,
    pub sent: Mutex<Vec<Sent>>,
}

impl DeviceLog {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Everything sent except device-log mirroring.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| !matches!(sent, Sent::Exec(cmd) if cmd.starts_with("send log")))
            .cloned()
            .collect()
    }

    pub fn mirrored(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|sent| match sent {
                Sent::Exec(cmd) if cmd.starts_with("send log ") => {
                    Some(cmd["send log ".len()..].to_string())
                }
                _ => None,
            })
            .collect()
    }

    pub fn exec_started_with(&self, prefix: &str) -> bool {
        self.sent()
            .iter()
            .any(|sent| matches!(sent, Sent::Exec(cmd) if cmd.starts_with(prefix)))
    }
}

pub struct FakeTransport {
    script: DeviceScript,
    open_error: Option<SessionError>,
    pub log: Arc<DeviceLog>,
}

impl FakeTransport {
    pub fn new(script: DeviceScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            open_error: None,
            log: Arc::new(DeviceLog::default()),
        })
    }

    pub fn refusing(err: SessionError) -> Arc<Self> {
        Arc::new(Self {
            script: DeviceScript::default(),
            open_error: Some(err),
            log: Arc::new(DeviceLog::default()),
        })
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn open(
        &self,
        target: &SessionTarget,
        _credentials: &Credentials,
    ) -> Result<Box<dyn DeviceSession>, SessionError> {
        self.log.targets.lock().push(target.clone());
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeSession {
    script: DeviceScript,
    log: Arc<DeviceLog>,
}

#[async_trait]
impl DeviceSession for FakeSession {
    async fn run(
        &mut self,
        command: &str,
        _read_timeout: Option<Duration>,
    ) -> Result<String, SessionError> {
        self.log.sent.lock().push(Sent::Exec(command.to_string()));
        if let Some(delay) = self.script.delay_for(command) {
            tokio::time::sleep(delay).await;
        }
        match self.script.reply(command) {
            Reply::Output(output) => Ok(output),
            Reply::Fail(err) => Err(err),
            Reply::Panic => panic!("scripted panic on '{command}'"),
        }
    }

    async fn run_config(&mut self, lines: &[String]) -> Result<String, SessionError> {
        self.log.sent.lock().push(Sent::Config(lines.to_vec()));
        let first = lines.first().map(String::as_str).unwrap_or_default();
        match self.script.reply(first) {
            Reply::Output(output) => Ok(output),
            Reply::Fail(err) => Err(err),
            Reply::Panic => panic!("scripted panic on config block"),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn probe_settings() -> ProbeSettings {
    ProbeSettings {
        initial_wait: Duration::from_secs(30),
        retry_wait: Duration::from_secs(10),
        timeout: Duration::from_secs(5),
        max_attempts: 5,
    }
}

pub fn plan() -> UpgradePlan {
    UpgradePlan::new(TFTP, IMAGE)
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub reports: mpsc::UnboundedReceiver<WorkflowReport>,
    pub connector: Arc<FakeConnector>,
    pub transport: Arc<FakeTransport>,
}

impl Harness {
    pub fn new(
        resolution: ResolutionMode,
        connector: Arc<FakeConnector>,
        transport: Arc<FakeTransport>,
        plan: UpgradePlan,
    ) -> Self {
        Self::with_settings(
            resolution,
            connector,
            transport,
            plan,
            DispatchSettings::default(),
        )
    }

    pub fn with_settings(
        resolution: ResolutionMode,
        connector: Arc<FakeConnector>,
        transport: Arc<FakeTransport>,
        plan: UpgradePlan,
        settings: DispatchSettings,
    ) -> Self {
        let parser = TriggerParser::new(TriggerSettings {
            resolution,
            ..TriggerSettings::default()
        });
        let prober = ReadinessProber::new(connector.clone(), probe_settings());
        let (dispatcher, reports) = Dispatcher::new(
            settings,
            parser,
            prober,
            transport.clone(),
            Credentials::new("admin", "cisco"),
            UpgradeSequencer::new(Arc::new(plan)),
        );
        Self {
            dispatcher,
            reports,
            connector,
            transport,
        }
    }

    pub fn trigger(&self, dir: &Path, name: &str) -> Option<ztp_core::WorkflowId> {
        let event = TriggerEvent::from_path(dir.join(name)).expect("trigger path has a name");
        self.dispatcher.handle_event(event)
    }

    pub async fn next_report(&mut self) -> WorkflowReport {
        self.reports
            .recv()
            .await
            .expect("dispatcher should send a report")
    }
}
