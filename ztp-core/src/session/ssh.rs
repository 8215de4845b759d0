//! libssh2-backed sessions driving an interactive IOS-style shell.
//!
//! Network operating systems expect a PTY and an interactive CLI rather than
//! one exec channel per command, so a single shell channel is kept open and
//! each command is written to it and read back until the exec prompt returns.
//! All libssh2 calls are blocking and run on the blocking thread pool.
//!
//! When a read times out the device is usually parked at a question such as
//! `Destination filename [..]?`. The shell sends Ctrl-C once and waits briefly
//! for the exec prompt; until it comes back no line is written, so nothing can
//! be taken as the answer.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use ssh2::{Channel, Session};
use tokio::task::spawn_blocking;
use tracing::{debug, trace};

use super::{
    Credentials, DeviceSession, DeviceTransport, SessionError, SessionSettings, SessionTarget,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 8 * 1024;
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// How long to wait for the exec prompt after an interrupt.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);
const INTERRUPT: &[u8] = b"\x03";

static PROMPT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>[A-Za-z0-9_.\-/:@]+)(?:\([A-Za-z0-9_.\-]+\))?[>#]\s*$")
        .expect("prompt regex should compile")
});

/// Platforms whose CLI this shell driver understands.
const SUPPORTED_PLATFORMS: &[&str] = &["cisco_ios", "cisco_xe", "cisco_nxos", "ios"];

#[derive(Debug, Clone)]
pub struct SshTransport {
    settings: SessionSettings,
}

impl SshTransport {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DeviceTransport for SshTransport {
    async fn open(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn DeviceSession>, SessionError> {
        if !SUPPORTED_PLATFORMS.contains(&target.platform.as_str()) {
            return Err(SessionError::UnsupportedPlatform(target.platform.clone()));
        }

        let target = target.clone();
        let credentials = credentials.clone();
        let timeout = self.settings.command_timeout;
        let shell = spawn_blocking(move || ShellChannel::connect(&target, &credentials, timeout))
            .await
            .map_err(|err| SessionError::Task(err.to_string()))??;

        Ok(Box::new(SshDeviceSession {
            shell: Arc::new(Mutex::new(shell)),
            default_timeout: self.settings.command_timeout,
        }))
    }
}

struct SshDeviceSession {
    shell: Arc<Mutex<ShellChannel>>,
    default_timeout: Duration,
}

impl SshDeviceSession {
    async fn with_shell<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ShellChannel) -> Result<T, SessionError> + Send + 'static,
    {
        let shell = Arc::clone(&self.shell);
        spawn_blocking(move || {
            let mut guard = shell.lock();
            op(&mut guard)
        })
        .await
        .map_err(|err| SessionError::Task(err.to_string()))?
    }
}

#[async_trait]
impl DeviceSession for SshDeviceSession {
    async fn run(
        &mut self,
        command: &str,
        read_timeout: Option<Duration>,
    ) -> Result<String, SessionError> {
        let command = command.to_string();
        let limit = read_timeout.unwrap_or(self.default_timeout);
        self.with_shell(move |shell| shell.exec(&command, limit)).await
    }

    async fn run_config(&mut self, lines: &[String]) -> Result<String, SessionError> {
        let lines = lines.to_vec();
        let limit = self.default_timeout;
        self.with_shell(move |shell| shell.configure(&lines, limit))
            .await
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        self.with_shell(|shell| shell.shutdown()).await
    }
}

struct ShellChannel {
    session: Session,
    channel: Channel,
    /// Hostname part of the exec prompt, learned after login.
    base_prompt: Option<String>,
    target: String,
    /// A read timed out and the interrupt did not bring the prompt back.
    pending_prompt: bool,
}

impl ShellChannel {
    fn connect(
        target: &SessionTarget,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let label = format!("{}:{}", target.address, target.port);
        let connect_err = |reason: String| SessionError::Connect {
            target: label.clone(),
            reason,
        };

        let addr = (target.address.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|err| connect_err(err.to_string()))?
            .next()
            .ok_or_else(|| connect_err("address did not resolve".into()))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| connect_err(err.to_string()))?;

        let mut session = Session::new().map_err(|err| connect_err(err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|err| connect_err(format!("handshake: {err}")))?;
        session
            .userauth_password(&credentials.username, credentials.password())
            .map_err(|_| SessionError::Authentication {
                target: label.clone(),
                username: credentials.username.clone(),
            })?;
        if !session.authenticated() {
            return Err(SessionError::Authentication {
                target: label.clone(),
                username: credentials.username.clone(),
            });
        }

        let mut channel = session
            .channel_session()
            .map_err(|err| SessionError::Channel(err.to_string()))?;
        channel
            .request_pty("vt100", None, Some((511, 24, 0, 0)))
            .map_err(|err| SessionError::Channel(err.to_string()))?;
        channel
            .shell()
            .map_err(|err| SessionError::Channel(err.to_string()))?;
        session.set_blocking(false);

        let mut shell = Self {
            session,
            channel,
            base_prompt: None,
            target: label,
            pending_prompt: false,
        };

        let banner = shell.read_until_prompt(timeout)?;
        shell.base_prompt = last_prompt_base(&banner);
        debug!(
            target_host = %shell.target,
            prompt = shell.base_prompt.as_deref().unwrap_or("?"),
            "ssh shell ready"
        );
        shell.exec("terminal length 0", timeout)?;
        Ok(shell)
    }

    fn exec(&mut self, command: &str, limit: Duration) -> Result<String, SessionError> {
        if self.pending_prompt {
            return Err(SessionError::PromptPending);
        }
        trace!(target_host = %self.target, command, "sending command");
        self.write_line(command)?;
        let raw = self.read_until_prompt(limit)?;
        Ok(strip_echo_and_prompt(&raw, command))
    }

    fn configure(&mut self, lines: &[String], limit: Duration) -> Result<String, SessionError> {
        let mut transcript = String::new();
        transcript.push_str(&self.exec("configure terminal", limit)?);
        for line in lines {
            let output = self.exec(line, limit)?;
            if !output.is_empty() {
                if !transcript.is_empty() {
                    transcript.push('\n');
                }
                transcript.push_str(&output);
            }
        }
        let output = self.exec("end", limit)?;
        if !output.is_empty() {
            transcript.push('\n');
            transcript.push_str(&output);
        }
        Ok(transcript)
    }

    fn shutdown(&mut self) -> Result<(), SessionError> {
        let bytes = farewell(self.pending_prompt);
        if let Err(err) = self.write_raw(bytes) {
            debug!(target_host = %self.target, error = %err, "failed to send session farewell");
        }
        self.session.set_blocking(true);
        if let Err(err) = self.channel.close() {
            debug!(target_host = %self.target, error = %err, "failed to close shell channel");
        }
        self.session
            .disconnect(None, "provisioning complete", None)
            .map_err(|err| SessionError::Channel(err.to_string()))
    }

    fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.write_raw(format!("{line}\n").as_bytes())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let deadline = Instant::now() + WRITE_DEADLINE;
        let stalled = || SessionError::Channel("write stalled".into());
        let mut written = 0;
        while written < bytes.len() {
            match self.channel.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return Err(stalled());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(SessionError::Channel(err.to_string())),
            }
        }
        loop {
            match self.channel.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return Err(stalled());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(SessionError::Channel(err.to_string())),
            }
        }
    }

    fn read_until_prompt(&mut self, limit: Duration) -> Result<String, SessionError> {
        let mut output = String::new();
        if self.poll_prompt(limit, &mut output)? {
            return Ok(output);
        }
        let partial = output.trim().to_string();
        self.interrupt();
        Err(SessionError::PromptTimeout {
            timeout: limit,
            partial,
        })
    }

    /// Send Ctrl-C and wait for the exec prompt. Leaves `pending_prompt` set
    /// when the device does not come back.
    fn interrupt(&mut self) {
        self.pending_prompt = true;
        if let Err(err) = self.write_raw(INTERRUPT) {
            debug!(target_host = %self.target, error = %err, "failed to interrupt device prompt");
            return;
        }
        let mut discarded = String::new();
        match self.poll_prompt(INTERRUPT_GRACE, &mut discarded) {
            Ok(true) => {
                debug!(target_host = %self.target, "exec prompt regained after interrupt");
                self.pending_prompt = false;
            }
            Ok(false) => {
                debug!(target_host = %self.target, "device still waiting after interrupt");
            }
            Err(err) => {
                debug!(target_host = %self.target, error = %err, "read failed after interrupt");
            }
        }
    }

    /// Read into `output` until the exec prompt shows up (`true`) or `limit`
    /// passes (`false`).
    fn poll_prompt(&mut self, limit: Duration, output: &mut String) -> Result<bool, SessionError> {
        let deadline = Instant::now() + limit;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            match self.channel.read(&mut chunk) {
                Ok(0) => {
                    if self.channel.eof() {
                        return Err(SessionError::Channel(format!(
                            "channel closed by {}",
                            self.target
                        )));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Ok(n) => {
                    output.push_str(&String::from_utf8_lossy(&chunk[..n]).replace('\r', ""));
                    if ends_with_prompt(output, self.base_prompt.as_deref()) {
                        return Ok(true);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(SessionError::Channel(err.to_string())),
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }
}

/// `exit` logs out cleanly, but a device still waiting at a question would
/// take it as the answer.
fn farewell(pending_prompt: bool) -> &'static [u8] {
    if pending_prompt { INTERRUPT } else { b"exit\n" }
}

fn last_line(text: &str) -> &str {
    text.trim_end_matches(['\n', ' '])
        .rsplit('\n')
        .next()
        .unwrap_or_default()
}

fn ends_with_prompt(text: &str, base: Option<&str>) -> bool {
    let line = last_line(text).trim();
    match PROMPT_LINE.captures(line) {
        Some(caps) => match base {
            Some(base) => caps.name("base").is_some_and(|m| m.as_str() == base),
            None => true,
        },
        None => false,
    }
}

fn last_prompt_base(text: &str) -> Option<String> {
    let line = last_line(text).trim();
    PROMPT_LINE
        .captures(line)
        .and_then(|caps| caps.name("base"))
        .map(|m| m.as_str().to_string())
}

/// Drop the echoed command (first line) and the trailing prompt line.
fn strip_echo_and_prompt(raw: &str, command: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    if lines
        .first()
        .is_some_and(|first| first.trim_end().ends_with(command.trim()))
    {
        lines.remove(0);
    }
    while lines.last().is_some_and(|last| last.trim().is_empty()) {
        lines.pop();
    }
    if lines
        .last()
        .is_some_and(|last| PROMPT_LINE.is_match(last.trim()))
    {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}
