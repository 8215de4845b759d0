//! Remote command-execution sessions.
//!
//! A [`DeviceTransport`] opens exactly one authenticated [`DeviceSession`] per
//! device workflow. [`DeviceSession::close`] consumes the session, so a
//! session cannot be closed twice or used after teardown.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(feature = "ssh")]
pub mod ssh;

#[cfg(feature = "ssh")]
pub use ssh::SshTransport;

/// Device login. The password is wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.as_str()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub port: u16,
    /// Device platform label, e.g. `cisco_ios`.
    pub platform: String,
    /// Default read timeout for a single command.
    pub command_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            port: 22,
            platform: "cisco_ios".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Where and how to open a session.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub platform: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("authentication failed for {username}@{target}")]
    Authentication { target: String, username: String },
    #[error("pattern not detected before {timeout:?} timeout; last output: {partial}")]
    PromptTimeout { timeout: Duration, partial: String },
    /// A previous read timed out and the device is still waiting for an
    /// answer; any line written now would be taken as that answer.
    #[error("session is stopped at an unanswered device prompt")]
    PromptPending,
    #[error("channel error: {0}")]
    Channel(String),
    #[error("session task failed: {0}")]
    Task(String),
    #[error("unsupported platform '{0}'")]
    UnsupportedPlatform(String),
}

impl SessionError {
    /// Whatever text the device produced before the failure, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            SessionError::PromptTimeout { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DeviceSession: Send {
    /// Run one exec-mode command. `read_timeout` overrides the default
    /// command timeout for slow operations such as image transfers.
    async fn run(
        &mut self,
        command: &str,
        read_timeout: Option<Duration>,
    ) -> Result<String, SessionError>;

    /// Apply a configuration block (enter config mode, send lines, leave).
    async fn run_config(&mut self, lines: &[String]) -> Result<String, SessionError>;

    /// Tear down the remote channel.
    async fn close(self: Box<Self>) -> Result<(), SessionError>;
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn open(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn DeviceSession>, SessionError>;
}
