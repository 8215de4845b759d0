//! Per-device account of a workflow. Every entry is kept for the final report
//! and also logged on the `ztp::narrative` target.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Workflow steps that produce a narrative entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Detect,
    Resolve,
    Probe,
    Connect,
    CheckImage,
    TransferImage,
    SetBoot,
    PostConfig,
    ArchiveConfig,
    WriteMemory,
    Abort,
    Close,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Detect => "detect",
            Step::Resolve => "resolve",
            Step::Probe => "probe",
            Step::Connect => "connect",
            Step::CheckImage => "check-image",
            Step::TransferImage => "transfer",
            Step::SetBoot => "set-boot",
            Step::PostConfig => "post-config",
            Step::ArchiveConfig => "archive",
            Step::WriteMemory => "persist",
            Step::Abort => "abort",
            Step::Close => "close",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrativeEntry {
    pub at: DateTime<Utc>,
    pub step: Step,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for NarrativeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.format("%m/%d/%Y %I:%M:%S %p"),
            self.step,
            self.message
        )
    }
}

/// Ordered audit trail of one device workflow. Each entry is also emitted as
/// a tracing event on the `ztp::narrative` target.
#[derive(Debug, Clone)]
pub struct Narrative {
    hostname: String,
    entries: Vec<NarrativeEntry>,
}

impl Narrative {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            entries: Vec::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn record(&mut self, step: Step, message: impl Into<String>) {
        self.push(step, Severity::Info, message.into());
    }

    pub fn warn(&mut self, step: Step, message: impl Into<String>) {
        self.push(step, Severity::Warning, message.into());
    }

    fn push(&mut self, step: Step, severity: Severity, message: String) {
        match severity {
            Severity::Info => {
                info!(
                    target: "ztp::narrative",
                    hostname = %self.hostname,
                    step = %step,
                    "{message}"
                )
            }
            Severity::Warning => {
                warn!(
                    target: "ztp::narrative",
                    hostname = %self.hostname,
                    step = %step,
                    "{message}"
                )
            }
        }
        self.entries.push(NarrativeEntry {
            at: Utc::now(),
            step,
            severity,
            message,
        });
    }

    pub fn entries(&self) -> &[NarrativeEntry] {
        &self.entries
    }

    pub fn steps(&self) -> Vec<Step> {
        self.entries.iter().map(|entry| entry.step).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|entry| entry.message.contains(needle))
    }

    pub fn into_entries(self) -> Vec<NarrativeEntry> {
        self.entries
    }
}
