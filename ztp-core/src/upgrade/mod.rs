//! Firmware staging and configuration state machine.
//!
//! ```text
//! CheckImage ──present──────────────────────────┐
//!     │ absent                                   ▼
//!     └─► TransferImage ──ok──► SetBoot ─► PostConfig ─► ArchiveConfig ─► WriteMemory ─► Closed
//!              │ prompt / error                                                ▲
//!              └──────────────► Abort ─────────────────────────────────────────┘
//! ```
//!
//! Side effects are additive: nothing already applied on the device is rolled
//! back when a later step fails. The session is closed exactly once on every
//! path. Once a read times out the device is still sitting at whatever prompt
//! stopped it, so nothing else (not even a `send log` line) is written to the
//! session before it is closed.

pub mod classifier;
pub mod narrative;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::session::{DeviceSession, SessionError};
use crate::trigger::DeviceIdentity;

pub use classifier::{OutputClassifier, SignatureRule, Verdict};
pub use narrative::{Narrative, NarrativeEntry, Severity, Step};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Image already on the device.
    Skipped,
    Succeeded,
    /// The device waited for a confirmation the automation cannot give.
    PromptBlocked,
    Failed(String),
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Skipped => f.write_str("Skipped"),
            TransferOutcome::Succeeded => f.write_str("Succeeded"),
            TransferOutcome::PromptBlocked => f.write_str("PromptBlocked"),
            TransferOutcome::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    PromptBlocked,
    TransferFailed(String),
    StepFailed { step: Step, reason: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::PromptBlocked => f.write_str(
                "image transfer blocked by an interactive prompt on the device \
                 (enable 'file prompt quiet')",
            ),
            AbortReason::TransferFailed(reason) => write!(f, "image transfer failed: {reason}"),
            AbortReason::StepFailed { step, reason } => write!(f, "{step} failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Provisioned,
    Aborted(AbortReason),
}

/// What to run against every device.
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub tftp_address: String,
    pub image_file: String,
    /// Device filesystem holding images, usually `flash`.
    pub flash_fs: String,
    pub post_config: Option<Vec<String>>,
    pub archive_prefix: Option<String>,
    pub transfer_timeout: Duration,
    /// Mirror short status lines to the device log with `send log`.
    pub mirror_to_device: bool,
    pub classifier: OutputClassifier,
}

impl UpgradePlan {
    pub fn new(tftp_address: impl Into<String>, image_file: impl Into<String>) -> Self {
        Self {
            tftp_address: tftp_address.into(),
            image_file: image_file.into(),
            flash_fs: "flash".to_string(),
            post_config: None,
            archive_prefix: None,
            transfer_timeout: Duration::from_secs(30 * 60),
            mirror_to_device: true,
            classifier: OutputClassifier::default(),
        }
    }

    pub fn image_path(&self) -> String {
        format!("{}:{}", self.flash_fs, self.image_file)
    }

    pub fn check_command(&self) -> String {
        format!("dir {}", self.image_path())
    }

    pub fn transfer_command(&self) -> String {
        format!(
            "copy tftp://{}/{} {}:",
            self.tftp_address, self.image_file, self.flash_fs
        )
    }

    pub fn boot_lines(&self) -> Vec<String> {
        vec![
            "no boot system".to_string(),
            format!("boot system {}", self.image_path()),
        ]
    }

    pub fn archive_command(&self, hostname: &str) -> Option<String> {
        self.archive_prefix.as_deref().map(|prefix| {
            let prefix = prefix.trim_matches('/');
            if prefix.is_empty() {
                format!("copy running-config tftp://{}/{hostname}.cfg", self.tftp_address)
            } else {
                format!(
                    "copy running-config tftp://{}/{prefix}/{hostname}.cfg",
                    self.tftp_address
                )
            }
        })
    }

    pub fn persist_command(&self) -> &'static str {
        "write memory"
    }
}

/// Mutable state for one device run. Owned by the sequencer and dropped when
/// it returns.
pub struct UpgradeContext {
    pub identity: DeviceIdentity,
    session: Box<dyn DeviceSession>,
    pub image_present: Option<bool>,
    pub transfer_duration: Option<Duration>,
    pub transfer_outcome: Option<TransferOutcome>,
    /// Set by the first read timeout; blocks every later write.
    pub awaiting_prompt: bool,
    narrative: Narrative,
}

impl UpgradeContext {
    async fn exec(
        &mut self,
        command: &str,
        read_timeout: Option<Duration>,
    ) -> Result<String, SessionError> {
        if self.awaiting_prompt {
            return Err(SessionError::PromptPending);
        }
        let result = self.session.run(command, read_timeout).await;
        self.observe(&result);
        result
    }

    async fn configure(&mut self, lines: &[String]) -> Result<String, SessionError> {
        if self.awaiting_prompt {
            return Err(SessionError::PromptPending);
        }
        let result = self.session.run_config(lines).await;
        self.observe(&result);
        result
    }

    fn observe(&mut self, result: &Result<String, SessionError>) {
        if let Err(SessionError::PromptTimeout { partial, .. }) = result {
            debug!(
                hostname = %self.identity.hostname,
                partial = %partial,
                "read timed out; session left at a device prompt"
            );
            self.awaiting_prompt = true;
        }
    }
}

impl fmt::Debug for UpgradeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeContext")
            .field("identity", &self.identity)
            .field("image_present", &self.image_present)
            .field("transfer_duration", &self.transfer_duration)
            .field("transfer_outcome", &self.transfer_outcome)
            .field("awaiting_prompt", &self.awaiting_prompt)
            .field("narrative_entries", &self.narrative.entries().len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeReport {
    pub hostname: String,
    pub outcome: UpgradeOutcome,
    pub image_present: Option<bool>,
    pub transfer: Option<TransferOutcome>,
    pub transfer_duration: Option<Duration>,
    pub narrative: Narrative,
}

#[derive(Debug)]
enum State {
    CheckImage,
    TransferImage,
    SetBoot,
    PostConfig,
    ArchiveConfig,
    WriteMemory,
    Abort(AbortReason),
    Closed(UpgradeOutcome),
}

#[derive(Debug, Clone)]
pub struct UpgradeSequencer {
    plan: Arc<UpgradePlan>,
}

impl UpgradeSequencer {
    pub fn new(plan: Arc<UpgradePlan>) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &UpgradePlan {
        &self.plan
    }

    /// Drive one device from `CheckImage` to `Closed`. The session is always
    /// closed before this returns.
    pub async fn run(
        &self,
        identity: DeviceIdentity,
        session: Box<dyn DeviceSession>,
        narrative: Narrative,
    ) -> UpgradeReport {
        let mut ctx = UpgradeContext {
            identity,
            session,
            image_present: None,
            transfer_duration: None,
            transfer_outcome: None,
            awaiting_prompt: false,
            narrative,
        };

        let mut state = State::CheckImage;
        let outcome = loop {
            state = match state {
                State::CheckImage => self.check_image(&mut ctx).await,
                State::TransferImage => self.transfer_image(&mut ctx).await,
                State::SetBoot => self.set_boot(&mut ctx).await,
                State::PostConfig => self.post_config(&mut ctx).await,
                State::ArchiveConfig => self.archive_config(&mut ctx).await,
                State::WriteMemory => self.write_memory(&mut ctx).await,
                State::Abort(reason) => self.abort(&mut ctx, reason).await,
                State::Closed(outcome) => break outcome,
            };
        };

        self.close(ctx, outcome).await
    }

    async fn check_image(&self, ctx: &mut UpgradeContext) -> State {
        let image = self.plan.image_path();
        match ctx.exec(&self.plan.check_command(), None).await {
            Ok(listing) => {
                if self.plan.classifier.image_present(&listing) {
                    ctx.image_present = Some(true);
                    ctx.transfer_outcome = Some(TransferOutcome::Skipped);
                    ctx.narrative.record(
                        Step::CheckImage,
                        format!(
                            "Image {image} already present; transfer {}",
                            TransferOutcome::Skipped
                        ),
                    );
                    self.mirror(ctx, &format!("ZTP: {image} present, skipping transfer"))
                        .await;
                    State::SetBoot
                } else {
                    ctx.image_present = Some(false);
                    ctx.narrative.record(
                        Step::CheckImage,
                        format!("Image {image} absent; transfer required"),
                    );
                    State::TransferImage
                }
            }
            Err(err) => State::Abort(step_failed(Step::CheckImage, &err)),
        }
    }

    async fn transfer_image(&self, ctx: &mut UpgradeContext) -> State {
        let command = self.plan.transfer_command();
        info!(
            hostname = %ctx.identity.hostname,
            tftp = %self.plan.tftp_address,
            image = %self.plan.image_file,
            "starting image transfer"
        );
        self.mirror(
            ctx,
            &format!("ZTP: transferring {} from {}", self.plan.image_file, self.plan.tftp_address),
        )
        .await;

        let started = Instant::now();
        let result = ctx.exec(&command, Some(self.plan.transfer_timeout)).await;
        let elapsed = started.elapsed();
        ctx.transfer_duration = Some(elapsed);

        let outcome = self.plan.classifier.transfer_outcome(&result);
        ctx.transfer_outcome = Some(outcome.clone());
        let took = format_elapsed(elapsed);

        match outcome {
            TransferOutcome::Succeeded | TransferOutcome::Skipped => {
                ctx.narrative
                    .record(Step::TransferImage, format!("Transfer Succeeded in {took}"));
                self.mirror(ctx, &format!("ZTP: image transfer complete ({took})"))
                    .await;
                State::SetBoot
            }
            TransferOutcome::PromptBlocked => {
                ctx.narrative.warn(
                    Step::TransferImage,
                    format!("Transfer PromptBlocked after {took}"),
                );
                State::Abort(AbortReason::PromptBlocked)
            }
            TransferOutcome::Failed(reason) => {
                ctx.narrative.warn(
                    Step::TransferImage,
                    format!("Transfer Failed after {took}: {reason}"),
                );
                State::Abort(AbortReason::TransferFailed(reason))
            }
        }
    }

    async fn set_boot(&self, ctx: &mut UpgradeContext) -> State {
        let lines = self.plan.boot_lines();
        match ctx.configure(&lines).await {
            Ok(output) => {
                if let Some(rule) = self.plan.classifier.classify(&output) {
                    return State::Abort(AbortReason::StepFailed {
                        step: Step::SetBoot,
                        reason: format!("device rejected boot configuration ({})", rule.needle),
                    });
                }
                ctx.narrative.record(
                    Step::SetBoot,
                    format!("Boot system set to {}", self.plan.image_path()),
                );
                self.mirror(ctx, &format!("ZTP: boot system set to {}", self.plan.image_path()))
                    .await;
                State::PostConfig
            }
            Err(err) => State::Abort(step_failed(Step::SetBoot, &err)),
        }
    }

    async fn post_config(&self, ctx: &mut UpgradeContext) -> State {
        let Some(lines) = self.plan.post_config.as_ref().filter(|lines| !lines.is_empty()) else {
            return State::ArchiveConfig;
        };

        match ctx.configure(lines).await {
            Ok(output) => {
                match self.plan.classifier.classify(&output) {
                    Some(rule) => ctx.narrative.warn(
                        Step::PostConfig,
                        format!(
                            "Applied {} post-provisioning lines; device reported '{}'",
                            lines.len(),
                            rule.needle
                        ),
                    ),
                    None => ctx.narrative.record(
                        Step::PostConfig,
                        format!("Applied {} post-provisioning lines", lines.len()),
                    ),
                }
                self.mirror(ctx, "ZTP: post-provisioning configuration applied")
                    .await;
                State::ArchiveConfig
            }
            Err(err) => State::Abort(step_failed(Step::PostConfig, &err)),
        }
    }

    async fn archive_config(&self, ctx: &mut UpgradeContext) -> State {
        let Some(command) = self.plan.archive_command(&ctx.identity.hostname) else {
            return State::WriteMemory;
        };

        let result = ctx.exec(&command, Some(self.plan.transfer_timeout)).await;
        match result {
            Ok(output) if !self.plan.classifier.indicates_error(&output) => {
                ctx.narrative.record(
                    Step::ArchiveConfig,
                    format!("Running configuration archived ({command})"),
                );
                self.mirror(ctx, "ZTP: running configuration archived").await;
            }
            Ok(output) => {
                ctx.narrative.warn(
                    Step::ArchiveConfig,
                    format!("Archive push reported an error; continuing: {}", output.trim()),
                );
            }
            // A stalled push leaves the device at its prompt; `write memory`
            // would be taken as the answer.
            Err(err) => return State::Abort(step_failed(Step::ArchiveConfig, &err)),
        }
        State::WriteMemory
    }

    async fn write_memory(&self, ctx: &mut UpgradeContext) -> State {
        match ctx.exec(self.plan.persist_command(), None).await {
            Ok(output) => {
                if let Some(rule) = self.plan.classifier.classify(&output) {
                    return State::Abort(AbortReason::StepFailed {
                        step: Step::WriteMemory,
                        reason: format!("device reported '{}' while saving", rule.needle),
                    });
                }
                ctx.narrative
                    .record(Step::WriteMemory, "Configuration saved to startup-config");
                self.mirror(ctx, "ZTP: provisioning complete").await;
                State::Closed(UpgradeOutcome::Provisioned)
            }
            Err(err) => State::Abort(step_failed(Step::WriteMemory, &err)),
        }
    }

    async fn abort(&self, ctx: &mut UpgradeContext, reason: AbortReason) -> State {
        ctx.narrative
            .warn(Step::Abort, format!("Provisioning aborted: {reason}"));
        let short = match &reason {
            AbortReason::PromptBlocked => "ZTP: aborted, transfer blocked by prompt".to_string(),
            AbortReason::TransferFailed(_) => "ZTP: aborted, image transfer failed".to_string(),
            AbortReason::StepFailed { step, .. } => format!("ZTP: aborted at {step}"),
        };
        self.mirror(ctx, &short).await;
        State::Closed(UpgradeOutcome::Aborted(reason))
    }

    async fn close(&self, ctx: UpgradeContext, outcome: UpgradeOutcome) -> UpgradeReport {
        let UpgradeContext {
            identity,
            session,
            image_present,
            transfer_duration,
            transfer_outcome,
            awaiting_prompt: _,
            mut narrative,
        } = ctx;

        match session.close().await {
            Ok(()) => narrative.record(Step::Close, "Session closed"),
            Err(err) => narrative.warn(Step::Close, format!("Session close failed: {err}")),
        }

        UpgradeReport {
            hostname: identity.hostname,
            outcome,
            image_present,
            transfer: transfer_outcome,
            transfer_duration,
            narrative,
        }
    }

    /// Best-effort status line on the device's own log.
    async fn mirror(&self, ctx: &mut UpgradeContext, message: &str) {
        if !self.plan.mirror_to_device || ctx.awaiting_prompt {
            return;
        }
        let line: String = message
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        if let Err(err) = ctx.exec(&format!("send log {line}"), None).await {
            debug!(
                hostname = %ctx.identity.hostname,
                error = %err,
                "failed to mirror status to device log"
            );
        }
    }
}

fn step_failed(step: Step, err: &SessionError) -> AbortReason {
    AbortReason::StepFailed {
        step,
        reason: err.to_string(),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
