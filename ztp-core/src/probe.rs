//! Transport-level readiness probing.
//!
//! The prober only checks that a TCP connection to the management port is
//! accepted. It never authenticates, so "device is up" stays separate from
//! "credentials are valid".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Delay before the first attempt.
    pub initial_wait: Duration,
    /// Delay between a failed attempt and the next one.
    pub retry_wait: Duration,
    /// Per-attempt connect timeout.
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(30),
            retry_wait: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            max_attempts: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProbeOutcome::Reachable { attempts } | ProbeOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Single connection attempt against `(target, port)`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &str, port: u16, timeout: Duration) -> Result<(), ProbeError>;
}

/// Plain TCP connector; the stream is dropped as soon as it is accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &str, port: u16, limit: Duration) -> Result<(), ProbeError> {
        match timeout(limit, TcpStream::connect((target, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(err)) => Err(ProbeError::Connect(err.to_string())),
            Err(_) => Err(ProbeError::Timeout(limit)),
        }
    }
}

pub struct ReadinessProber {
    connector: Arc<dyn Connector>,
    settings: ProbeSettings,
}

impl fmt::Debug for ReadinessProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessProber")
            .field("connector", &std::any::type_name_of_val(self.connector.as_ref()))
            .field("settings", &self.settings)
            .finish()
    }
}

impl ReadinessProber {
    pub fn new(connector: Arc<dyn Connector>, settings: ProbeSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn tcp(settings: ProbeSettings) -> Self {
        Self::new(Arc::new(TcpConnector), settings)
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Wait `initial_wait`, then attempt up to `max_attempts` connections
    /// separated by `retry_wait`. Returns on the first accepted connection.
    pub async fn probe(&self, target: &str, port: u16) -> ProbeOutcome {
        let max_attempts = self.settings.max_attempts.max(1);

        debug!(
            target_host = target,
            port,
            wait = ?self.settings.initial_wait,
            "waiting before first reachability attempt"
        );
        sleep(self.settings.initial_wait).await;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .connector
                .connect(target, port, self.settings.timeout)
                .await
            {
                Ok(()) => {
                    info!(target_host = target, port, attempts, "device reachable");
                    return ProbeOutcome::Reachable { attempts };
                }
                Err(err) => {
                    if attempts >= max_attempts {
                        warn!(
                            target_host = target,
                            port,
                            attempts,
                            error = %err,
                            "device unreachable; giving up"
                        );
                        return ProbeOutcome::Exhausted {
                            attempts,
                            last_error: err.to_string(),
                        };
                    }
                    debug!(
                        target_host = target,
                        port,
                        attempt = attempts,
                        max_attempts,
                        error = %err,
                        "device not reachable yet"
                    );
                    sleep(self.settings.retry_wait).await;
                }
            }
        }
    }
}
