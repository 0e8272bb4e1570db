//! Device upgrade state machine
//!
//! Drives one device through connect, version check, download, snapshot,
//! readiness checks, backup, install, reboot verification and the
//! post-upgrade snapshot. Unreliable steps go through [`retry`].

use std::sync::Arc;

use fleet_models::{CheckStatus, DeviceFacts, Snapshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::client::{AssuranceProvider, DeviceClient, Session};
use crate::models::device::Device;
use crate::models::job::JobConfig;
use crate::models::result::{DeviceResult, Outcome, Pass, WarningKind};
use crate::models::version::SoftwareVersion;
use crate::upgrade::cancel::CancelSignal;
use crate::upgrade::fsm::UpgradeState;
use crate::upgrade::ha::{wait_for_sync, SyncStatus};
use crate::upgrade::progress::{AttemptEvent, ProgressObserver, RetryPhase};
use crate::upgrade::retry::{retry, PhaseOutcome, RetryReport};

/// Terminal decision for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub reason: String,
}

impl Verdict {
    fn new(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }
}

/// Live session plus what the device reported at version check
#[derive(Debug, Clone)]
pub struct Inspection {
    pub session: Session,
    pub facts: DeviceFacts,
}

/// Extra steps requested by the HA coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Wait for HA configuration sync with the peer after the reboot
    pub resync_after_reboot: bool,
}

/// Runs the per-device state machine against the external collaborators
#[derive(Clone)]
pub struct DeviceUpgrader {
    config: Arc<JobConfig>,
    client: Arc<dyn DeviceClient>,
    assurance: Arc<dyn AssuranceProvider>,
    progress: Arc<dyn ProgressObserver>,
    cancel: CancelSignal,
}

impl DeviceUpgrader {
    /// Create an upgrader shared by every worker of a job
    pub fn new(
        config: Arc<JobConfig>,
        client: Arc<dyn DeviceClient>,
        assurance: Arc<dyn AssuranceProvider>,
        progress: Arc<dyn ProgressObserver>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            config,
            client,
            assurance,
            progress,
            cancel,
        }
    }

    /// Get the job configuration
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Get the device API client
    pub fn client(&self) -> &Arc<dyn DeviceClient> {
        &self.client
    }

    /// Get the job's cancellation signal
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Run the whole machine for a device outside any HA pairing
    pub async fn run(&self, device: &mut Device, pass: Pass) -> DeviceResult {
        let mut result = DeviceResult::start(device, pass);
        let verdict = match self.inspect(device, &mut result).await {
            Ok(inspection) => {
                self.upgrade(device, inspection, UpgradeOptions::default(), &mut result)
                    .await
            }
            Err(verdict) => verdict,
        };
        result.finish(device, verdict.outcome, verdict.reason)
    }

    /// `Init -> Connected -> VersionChecked`
    ///
    /// Ends the device with `NoUpgradeNeeded` when it already runs the target
    /// version or something newer.
    pub async fn inspect(
        &self,
        device: &mut Device,
        result: &mut DeviceResult,
    ) -> Result<Inspection, Verdict> {
        info!("{}: connecting to {}", device.name, device.endpoint);

        let session = match self
            .client
            .connect(&device.endpoint, &self.config.credentials, &self.config.timeouts)
            .await
        {
            PhaseOutcome::Success(session) => session,
            PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
                return Err(self.fail(device, format!("connection failed: {reason}")));
            }
        };
        self.transition(device, UpgradeState::Connected)?;

        let facts = match self.client.facts(&session).await {
            PhaseOutcome::Success(facts) => facts,
            PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
                return Err(self.fail(device, format!("version check failed: {reason}")));
            }
        };

        let current: SoftwareVersion = match facts.version.parse() {
            Ok(version) => version,
            Err(_) => {
                return Err(self.fail(
                    device,
                    format!("device reported an unparseable version {:?}", facts.version),
                ));
            }
        };
        device.current_version = Some(current);
        device.ha_mode = facts.ha_mode();
        result.starting_version = Some(current);
        result.ha_mode = device.ha_mode;
        result.peer_serial = facts.peer().map(|peer| peer.serial.clone());
        self.transition(device, UpgradeState::VersionChecked)?;

        let target = device.target_version();
        if current >= target {
            self.transition(device, UpgradeState::NoUpgradeNeeded)?;
            let reason = if current == target {
                format!("already running {target}")
            } else {
                format!("running {current}, newer than target {target}; downgrade not attempted")
            };
            info!("{}: {}", device.name, reason);
            return Err(Verdict::new(Outcome::NoUpgradeNeeded, reason));
        }

        info!(
            "{}: running {}, upgrade to {} required",
            device.name, current, target
        );
        if device.ha_mode.is_paired() {
            info!("{}: HA member in {} state", device.name, device.ha_mode);
        }
        Ok(Inspection { session, facts })
    }

    /// `VersionChecked -> UpgradeRequired -> ... -> Done`
    pub async fn upgrade(
        &self,
        device: &mut Device,
        inspection: Inspection,
        options: UpgradeOptions,
        result: &mut DeviceResult,
    ) -> Verdict {
        match self.upgrade_phases(device, inspection, options, result).await {
            Ok(verdict) | Err(verdict) => verdict,
        }
    }

    async fn upgrade_phases(
        &self,
        device: &mut Device,
        inspection: Inspection,
        options: UpgradeOptions,
        result: &mut DeviceResult,
    ) -> Result<Verdict, Verdict> {
        let session = inspection.session;
        self.transition(device, UpgradeState::UpgradeRequired)?;
        self.check_cancelled(device)?;

        self.transition(device, UpgradeState::Downloading)?;
        let download_started = Instant::now();
        self.download(device, &session).await?;
        result.download_elapsed = Some(download_started.elapsed());
        self.transition(device, UpgradeState::Downloaded)?;

        self.transition(device, UpgradeState::PreSnapshot)?;
        let pre_snapshot = self.snapshot(device, &session, true, result).await?;

        self.readiness(device, &session, result).await?;
        self.transition(device, UpgradeState::ReadinessChecked)?;

        match self.client.export_config(&session).await {
            PhaseOutcome::Success(backup) => {
                debug!("{}: configuration exported ({} bytes)", device.name, backup.content.len());
                result.backup = Some(backup);
            }
            PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
                return Err(self.fail(device, format!("configuration backup failed: {reason}")));
            }
        }
        self.transition(device, UpgradeState::BackedUp)?;

        if device.is_dry_run() {
            self.transition(device, UpgradeState::DryRunHalt)?;
            info!("{}: dry run, stopping before install", device.name);
            return Ok(Verdict::new(
                Outcome::DryRun,
                format!("dry run: {} would be installed", device.target_version()),
            ));
        }

        self.check_cancelled(device)?;
        self.transition(device, UpgradeState::Installing)?;
        self.install(device, &session).await?;
        self.transition(device, UpgradeState::Installed)?;

        // Past this point the device is committed; cancellation is ignored
        let reboot_started = Instant::now();
        self.transition(device, UpgradeState::Rebooting)?;
        let session = self.reboot_and_verify(device, &session).await?;
        result.reboot_elapsed = Some(reboot_started.elapsed());
        self.transition(device, UpgradeState::RebootVerified)?;

        if options.resync_after_reboot {
            if let SyncStatus::TimedOut(message) =
                wait_for_sync(self, &device.name, &session, false).await
            {
                warn!("{}: {}", device.name, message);
                result.warn(WarningKind::HaSync, message);
            }
        }

        self.transition(device, UpgradeState::PostSnapshot)?;
        if let Some(pre) = pre_snapshot {
            if let Some(post) = self.snapshot(device, &session, false, result).await? {
                result.diff = Some(self.assurance.diff(&pre, &post).await);
            }
        }
        self.transition(device, UpgradeState::Done)?;

        let from = result
            .starting_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let reason = format!("upgraded from {from} to {}", device.target_version());
        info!("{}: {}", device.name, reason);
        Ok(Verdict::new(Outcome::Upgraded, reason))
    }

    /// Stage the target image, fetching its base image first when missing
    async fn download(&self, device: &mut Device, session: &Session) -> Result<(), Verdict> {
        let target = device.target_version();
        let base = target.base_image();

        let images = match self.client.available_images(session).await {
            PhaseOutcome::Success(images) => images,
            PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
                return Err(self.fail(device, format!("image listing failed: {reason}")));
            }
        };
        let lookup = |version: &SoftwareVersion| {
            images
                .iter()
                .find(|image| image.version.parse::<SoftwareVersion>().ok() == Some(*version))
        };

        let Some(target_image) = lookup(&target) else {
            return Err(self.fail(
                device,
                format!("target version {target} is not available on the device"),
            ));
        };
        if target_image.downloaded {
            info!("{}: {} already downloaded", device.name, target);
            return Ok(());
        }

        let base_downloaded = lookup(&base).map(|image| image.downloaded).unwrap_or(false);
        if !target.is_base_image() && !base_downloaded {
            info!("{}: downloading base image {}", device.name, base);
            self.download_one(device, session, base, RetryPhase::BaseDownload)
                .await?;

            debug!(
                "{}: waiting {:?} before the target download",
                device.name, self.config.download_settle
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.download_settle) => {}
                _ = self.cancel.cancelled() => return Err(self.cancelled(device)),
            }
        }

        info!("{}: downloading {}", device.name, target);
        self.download_one(device, session, target, RetryPhase::Download)
            .await
    }

    async fn download_one(
        &self,
        device: &mut Device,
        session: &Session,
        version: SoftwareVersion,
        phase: RetryPhase,
    ) -> Result<(), Verdict> {
        let client = &self.client;
        let report = retry(
            &self.config.policies.download,
            Some(&self.cancel),
            self.observer(&device.name, phase),
            |_| async move { client.download_image(session, &version).await },
        )
        .await;

        device.attempts.download += report.attempts;
        self.settle(device, report, format!("download of {version}"))
    }

    /// Pre- or post-upgrade snapshot; failures only warn
    async fn snapshot(
        &self,
        device: &mut Device,
        session: &Session,
        interruptible: bool,
        result: &mut DeviceResult,
    ) -> Result<Option<Snapshot>, Verdict> {
        let categories = &self.config.snapshot_categories;
        if categories.is_empty() {
            return Ok(None);
        }

        let assurance = &self.assurance;
        let cancel = interruptible.then_some(&self.cancel);
        let report = retry(
            &self.config.policies.snapshot,
            cancel,
            self.observer(&device.name, RetryPhase::Snapshot),
            |_| async move { assurance.snapshot(session, categories).await },
        )
        .await;

        if report.cancelled {
            return Err(self.cancelled(device));
        }
        match report.outcome {
            PhaseOutcome::Success(snapshot) => Ok(Some(snapshot)),
            PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
                let message = format!(
                    "snapshot capture failed after {} attempt(s): {reason}",
                    report.attempts
                );
                warn!("{}: {}", device.name, message);
                result.warn(WarningKind::Snapshot, message);
                Ok(None)
            }
        }
    }

    async fn readiness(
        &self,
        device: &mut Device,
        session: &Session,
        result: &mut DeviceResult,
    ) -> Result<(), Verdict> {
        let checks = &self.config.readiness_checks;
        if checks.is_empty() {
            return Ok(());
        }

        let report = self.assurance.run_checks(session, checks).await;
        let failed: Vec<&str> = report
            .iter()
            .filter(|(_, status)| **status == CheckStatus::Fail)
            .map(|(name, _)| name.as_str())
            .collect();

        let outcome = if failed.is_empty() {
            Ok(())
        } else {
            let message = format!("readiness checks failed: {}", failed.join(", "));
            if self.config.readiness_blocking {
                Err(message)
            } else {
                warn!("{}: {}", device.name, message);
                result.warn(WarningKind::Readiness, message);
                Ok(())
            }
        };
        result.readiness = Some(report);

        outcome.map_err(|message| self.fail(device, message))
    }

    async fn install(&self, device: &mut Device, session: &Session) -> Result<(), Verdict> {
        let target = device.target_version();
        let client = &self.client;
        info!("{}: installing {}", device.name, target);

        let report = retry(
            &self.config.policies.install,
            Some(&self.cancel),
            self.observer(&device.name, RetryPhase::Install),
            |_| async move { client.install_image(session, &target).await },
        )
        .await;

        device.attempts.install += report.attempts;
        self.settle(device, report, format!("install of {target}"))
    }

    /// Issue the reboot and poll until the device answers with the target version
    async fn reboot_and_verify(
        &self,
        device: &mut Device,
        session: &Session,
    ) -> Result<Session, Verdict> {
        info!("{}: rebooting", device.name);
        match self.client.reboot(session).await {
            PhaseOutcome::Success(()) => {}
            PhaseOutcome::Retryable(reason) => {
                // The connection commonly drops while the reboot is accepted
                debug!("{}: reboot request returned {}", device.name, reason);
            }
            PhaseOutcome::Fatal(reason) => {
                return Err(self.fail(device, format!("reboot failed: {reason}")));
            }
        }

        let policy = self.config.policies.reboot;
        tokio::time::sleep(policy.interval).await;

        let target = device.target_version();
        let client = &self.client;
        let endpoint = &device.endpoint;
        let credentials = &self.config.credentials;
        let timeouts = &self.config.timeouts;

        let report = retry(
            &policy,
            None,
            self.observer(&device.name, RetryPhase::Reboot),
            |_| async move {
                let session = match client.connect(endpoint, credentials, timeouts).await {
                    PhaseOutcome::Success(session) => session,
                    PhaseOutcome::Retryable(reason) => {
                        return PhaseOutcome::Retryable(format!("device not reachable: {reason}"))
                    }
                    PhaseOutcome::Fatal(reason) => return PhaseOutcome::Fatal(reason),
                };
                match client.facts(&session).await {
                    PhaseOutcome::Success(facts) => match facts.version.parse::<SoftwareVersion>() {
                        Ok(version) if version == target => PhaseOutcome::Success(session),
                        Ok(version) => PhaseOutcome::Fatal(format!(
                            "version mismatch: expected {target}, device reports {version}"
                        )),
                        Err(_) => PhaseOutcome::Retryable(format!(
                            "device reported an unparseable version {:?}",
                            facts.version
                        )),
                    },
                    PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
                        PhaseOutcome::Retryable(format!("version query failed: {reason}"))
                    }
                }
            },
        )
        .await;

        device.attempts.reboot += report.attempts;
        match report.outcome {
            PhaseOutcome::Success(session) => {
                device.current_version = Some(target);
                info!("{}: back online running {}", device.name, target);
                Ok(session)
            }
            PhaseOutcome::Fatal(reason) => Err(self.fail(device, reason)),
            PhaseOutcome::Retryable(reason) => Err(self.fail(
                device,
                format!(
                    "device did not come back on {target} after {} attempt(s): {reason}",
                    report.attempts
                ),
            )),
        }
    }

    /// Collapse a retry report into the phase result
    fn settle<T>(
        &self,
        device: &mut Device,
        report: RetryReport<T>,
        what: String,
    ) -> Result<T, Verdict> {
        if report.cancelled {
            return Err(self.cancelled(device));
        }
        match report.outcome {
            PhaseOutcome::Success(value) => Ok(value),
            PhaseOutcome::Fatal(reason) => Err(self.fail(device, format!("{what} failed: {reason}"))),
            PhaseOutcome::Retryable(reason) => Err(self.fail(
                device,
                format!("{what} failed after {} attempt(s): {reason}", report.attempts),
            )),
        }
    }

    pub(crate) fn observer<'a, T>(
        &'a self,
        device: &'a str,
        phase: RetryPhase,
    ) -> impl FnMut(u32, u32, &PhaseOutcome<T>) + 'a
    where
        T: 'a,
    {
        move |attempt, max_tries, outcome| {
            self.progress.on_attempt(&AttemptEvent {
                device,
                phase,
                attempt,
                max_tries,
                status: outcome.status(),
                reason: outcome.reason(),
            })
        }
    }

    pub(crate) fn transition(&self, device: &mut Device, next: UpgradeState) -> Result<(), Verdict> {
        if let Err(e) = device.advance(next) {
            return Err(self.fail(device, e));
        }
        self.progress.on_state(&device.name, next);
        Ok(())
    }

    fn check_cancelled(&self, device: &mut Device) -> Result<(), Verdict> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(device));
        }
        Ok(())
    }

    pub(crate) fn fail(&self, device: &mut Device, reason: impl Into<String>) -> Verdict {
        let reason = reason.into();
        error!("{}: upgrade failed in {}: {}", device.name, device.state(), reason);
        if device.advance(UpgradeState::Failed).is_ok() {
            self.progress.on_state(&device.name, UpgradeState::Failed);
        }
        Verdict::new(Outcome::Failed, reason)
    }

    pub(crate) fn cancelled(&self, device: &mut Device) -> Verdict {
        let during = device.state();
        warn!("{}: job cancelled in {}", device.name, during);
        if device.advance(UpgradeState::Cancelled).is_ok() {
            self.progress.on_state(&device.name, UpgradeState::Cancelled);
        }
        Verdict::new(Outcome::Cancelled, format!("job cancelled during {during}"))
    }
}
