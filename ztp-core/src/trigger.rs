//! Trigger file parsing.
//!
//! A trigger file is named `<hostname>_<hostAddress>[_...]`. Parsing turns the
//! observed path into a [`DeviceIdentity`] whose `connect_target` is already
//! resolved, so nothing downstream needs to know which [`ResolutionMode`] was
//! configured.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static EMBEDDED_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)ip address\s+(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b")
        .expect("embedded address regex should compile")
});

/// How the connect target is chosen from a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolutionMode {
    /// Connect by hostname (`ssh_method: dns`).
    #[serde(rename = "dns")]
    ByHostname,
    /// Connect by the address token in the file name (`ssh_method: ip`).
    #[default]
    #[serde(rename = "ip")]
    ByAddress,
    /// Connect by the `ip address` found in the file body (`ssh_method: parse`).
    #[serde(rename = "parse")]
    ByParsedAddress,
}

impl ResolutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionMode::ByHostname => "dns",
            ResolutionMode::ByAddress => "ip",
            ResolutionMode::ByParsedAddress => "parse",
        }
    }

    /// Whether resolving a target needs the trigger file's content.
    pub fn needs_content(self) -> bool {
        matches!(self, ResolutionMode::ByParsedAddress)
    }
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionMode {
    type Err = TriggerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dns" => Ok(ResolutionMode::ByHostname),
            "ip" => Ok(ResolutionMode::ByAddress),
            "parse" => Ok(ResolutionMode::ByParsedAddress),
            other => Err(TriggerError::UnknownResolutionMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger path {0} has no file name")]
    MissingFileName(PathBuf),
    #[error("file name '{0}' does not match <hostname>_<address>; need two '_' separated tokens")]
    MalformedName(String),
    #[error("no 'ip address' line found in {0}")]
    NoEmbeddedAddress(String),
    #[error("failed to read trigger file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("unknown ssh_method '{0}' (expected dns, ip or parse)")]
    UnknownResolutionMode(String),
}

/// A file-creation notification for the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub raw_path: PathBuf,
    pub file_name: String,
}

impl TriggerEvent {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, TriggerError> {
        let raw_path = path.into();
        let file_name = raw_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TriggerError::MissingFileName(raw_path.clone()))?;
        Ok(Self {
            raw_path,
            file_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.raw_path
    }
}

/// Device identity derived from a trigger. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub host_address: String,
    pub embedded_address: Option<String>,
    pub connect_target: String,
}

/// Name-only result of parsing a trigger. In `parse` mode the connect target
/// is still pending until the file body is supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerName {
    pub hostname: String,
    pub host_address: String,
}

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub resolution: ResolutionMode,
    /// Substrings that mark editor swap/backup files and similar noise.
    pub ignore_patterns: Vec<String>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            resolution: ResolutionMode::default(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

pub fn default_ignore_patterns() -> Vec<String> {
    vec![".swp".to_string(), ".save".to_string(), "~".to_string()]
}

#[derive(Debug, Clone)]
pub struct TriggerParser {
    settings: TriggerSettings,
}

impl TriggerParser {
    pub fn new(settings: TriggerSettings) -> Self {
        Self { settings }
    }

    pub fn resolution(&self) -> ResolutionMode {
        self.settings.resolution
    }

    /// Silent filter: ignored names never launch a workflow and are not errors.
    pub fn is_ignored(&self, event: &TriggerEvent) -> bool {
        self.settings
            .ignore_patterns
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| event.file_name.contains(pattern.as_str()))
    }

    pub fn parse_name(&self, event: &TriggerEvent) -> Result<TriggerName, TriggerError> {
        let mut tokens = event.file_name.split('_');
        let hostname = tokens.next().unwrap_or_default();
        let host_address = tokens.next().unwrap_or_default();
        if hostname.is_empty() || host_address.is_empty() {
            return Err(TriggerError::MalformedName(event.file_name.clone()));
        }
        Ok(TriggerName {
            hostname: hostname.to_string(),
            host_address: host_address.to_string(),
        })
    }

    /// Resolve a parsed name into a full identity. `content` is only consulted
    /// in `parse` mode, where it is required.
    pub fn resolve(
        &self,
        event: &TriggerEvent,
        name: TriggerName,
        content: Option<&str>,
    ) -> Result<DeviceIdentity, TriggerError> {
        let embedded = content.and_then(extract_embedded_address);
        let (embedded_address, connect_target) = match self.settings.resolution {
            ResolutionMode::ByHostname => (embedded, name.hostname.clone()),
            ResolutionMode::ByAddress => (embedded, name.host_address.clone()),
            ResolutionMode::ByParsedAddress => {
                let address = embedded
                    .ok_or_else(|| TriggerError::NoEmbeddedAddress(event.file_name.clone()))?;
                (Some(address.clone()), address)
            }
        };

        Ok(DeviceIdentity {
            hostname: name.hostname,
            host_address: name.host_address,
            embedded_address,
            connect_target,
        })
    }

    /// Parse and resolve in one step.
    pub fn parse(
        &self,
        event: &TriggerEvent,
        content: Option<&str>,
    ) -> Result<DeviceIdentity, TriggerError> {
        let name = self.parse_name(event)?;
        self.resolve(event, name, content)
    }
}

/// First `ip address <IPv4>` occurrence in a configuration body.
pub fn extract_embedded_address(content: &str) -> Option<String> {
    EMBEDDED_ADDRESS
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|candidate| candidate.parse::<Ipv4Addr>().is_ok())
        .map(str::to_string)
}
