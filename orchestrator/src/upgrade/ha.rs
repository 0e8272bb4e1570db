//! HA coordination
//!
//! Wraps the device state machine so both members of an HA pair never lose
//! service at the same time. Active members whose peer is not behind them are
//! deferred to the revisit pass; passive members go first and resynchronize
//! with their peer after the reboot.

use std::collections::HashMap;

use fleet_models::{DeviceFacts, HaMode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::client::Session;
use crate::models::device::Device;
use crate::models::result::{DeviceResult, Outcome, Pass, WarningKind};
use crate::models::version::SoftwareVersion;
use crate::upgrade::fsm::UpgradeState;
use crate::upgrade::machine::{DeviceUpgrader, UpgradeOptions};
use crate::upgrade::progress::RetryPhase;
use crate::upgrade::retry::{retry, PhaseOutcome};

/// What to do with a device once its version and HA state are known
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaPlan {
    Proceed {
        /// Suspend the local HA member before the upgrade starts
        suspend: bool,
        options: UpgradeOptions,
        warning: Option<String>,
    },

    /// Hold the device back for the revisit pass
    Defer { reason: String },
}

impl HaPlan {
    fn proceed() -> Self {
        HaPlan::Proceed {
            suspend: false,
            options: UpgradeOptions::default(),
            warning: None,
        }
    }
}

/// Decide how a device at `local` takes part in the given pass
pub fn plan(facts: &DeviceFacts, local: SoftwareVersion, pass: Pass) -> HaPlan {
    match facts.ha_mode() {
        HaMode::None => HaPlan::proceed(),

        HaMode::Active => {
            let active = |warning: Option<String>| HaPlan::Proceed {
                suspend: true,
                options: UpgradeOptions::default(),
                warning,
            };
            if pass == Pass::Revisit {
                return active(None);
            }

            let Some(peer) = facts.peer() else {
                return active(Some("active member reports no HA peer".to_string()));
            };
            match peer.version.parse::<SoftwareVersion>() {
                Ok(peer_version) if peer_version >= local => HaPlan::Defer {
                    reason: format!(
                        "peer {} runs {}, not behind local {}",
                        peer.serial, peer_version, local
                    ),
                },
                Ok(_) => active(None),
                Err(_) => active(Some(format!(
                    "peer {} reported an unparseable version {:?}",
                    peer.serial, peer.version
                ))),
            }
        }

        HaMode::Passive => HaPlan::Proceed {
            suspend: false,
            options: UpgradeOptions {
                resync_after_reboot: true,
            },
            warning: None,
        },

        HaMode::NonFunctional => HaPlan::proceed(),

        HaMode::Unknown => HaPlan::Proceed {
            suspend: false,
            options: UpgradeOptions::default(),
            warning: Some("HA mode could not be determined".to_string()),
        },
    }
}

/// Device held back in pass 1, handed to the scheduler over the revisit channel
#[derive(Debug)]
pub struct Deferral {
    pub device: Device,
    /// Peer serial reported in pass 1
    pub peer: Option<String>,
    /// Why the device was deferred
    pub reason: String,
}

/// Report of one pass-1 unit
#[derive(Debug)]
pub enum UnitReport {
    Finished(DeviceResult),
    Deferred { serial: String, peer: Option<String> },
}

/// Result of waiting for HA configuration sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    TimedOut(String),
    Cancelled,
}

/// Poll the device until it reports its HA configuration in sync with the peer
///
/// Bounded by the job's HA sync policy. Not reaching sync is advisory.
pub async fn wait_for_sync(
    upgrader: &DeviceUpgrader,
    device: &str,
    session: &Session,
    interruptible: bool,
) -> SyncStatus {
    let client = upgrader.client();
    let policy = upgrader.config().policies.ha_sync;
    let cancel = interruptible.then(|| upgrader.cancel_signal());

    debug!("{}: waiting for HA configuration sync", device);
    let report = retry(
        &policy,
        cancel,
        upgrader.observer(device, RetryPhase::HaSync),
        |_| async move {
            match client.facts(session).await {
                PhaseOutcome::Success(facts) => match facts.ha {
                    Some(ha) if ha.config_synced => PhaseOutcome::Success(()),
                    Some(_) => {
                        PhaseOutcome::Retryable("HA configuration not synchronized".to_string())
                    }
                    None => {
                        PhaseOutcome::Fatal("device no longer reports HA state".to_string())
                    }
                },
                PhaseOutcome::Retryable(reason) => PhaseOutcome::Retryable(reason),
                PhaseOutcome::Fatal(reason) => PhaseOutcome::Fatal(reason),
            }
        },
    )
    .await;

    if report.cancelled {
        return SyncStatus::Cancelled;
    }
    match report.outcome {
        PhaseOutcome::Success(()) => {
            info!("{}: HA configuration synchronized", device);
            SyncStatus::Synced
        }
        PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
            SyncStatus::TimedOut(format!(
                "HA sync not confirmed after {} attempt(s): {reason}",
                report.attempts
            ))
        }
    }
}

/// Best-effort HA suspend; failures become warnings
async fn suspend(
    upgrader: &DeviceUpgrader,
    device: &Device,
    session: &Session,
    result: &mut DeviceResult,
) {
    if device.is_dry_run() || upgrader.cancel_signal().is_cancelled() {
        return;
    }

    info!("{}: suspending HA active state", device.name);
    match upgrader.client().suspend_ha(session).await {
        PhaseOutcome::Success(()) => {}
        PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => {
            let message = format!("HA suspend failed: {reason}");
            warn!("{}: {}, continuing", device.name, message);
            result.warn(WarningKind::HaSuspend, message);
        }
    }
}

/// Pass-1 unit: inspect, then upgrade or defer
pub async fn first_pass(
    upgrader: &DeviceUpgrader,
    mut device: Device,
    revisit: &mpsc::UnboundedSender<Deferral>,
) -> UnitReport {
    let mut result = DeviceResult::start(&device, Pass::First);

    let inspection = match upgrader.inspect(&mut device, &mut result).await {
        Ok(inspection) => inspection,
        Err(verdict) => {
            return UnitReport::Finished(result.finish(&device, verdict.outcome, verdict.reason))
        }
    };

    let local = device.current_version.unwrap_or_else(|| device.target_version());
    match plan(&inspection.facts, local, Pass::First) {
        HaPlan::Defer { reason } => {
            if let Err(e) = upgrader.transition(&mut device, UpgradeState::Deferred) {
                return UnitReport::Finished(result.finish(&device, e.outcome, e.reason));
            }
            info!("{}: deferred to the revisit pass: {}", device.name, reason);

            let serial = device.serial.clone();
            let peer = result.peer_serial.clone();
            let deferral = Deferral {
                device,
                peer: peer.clone(),
                reason,
            };
            if let Err(mpsc::error::SendError(deferral)) = revisit.send(deferral) {
                // Scheduler stopped listening; finish here rather than lose the device
                let mut device = deferral.device;
                let verdict = upgrader.fail(&mut device, "revisit queue closed");
                return UnitReport::Finished(result.finish(&device, verdict.outcome, verdict.reason));
            }
            UnitReport::Deferred { serial, peer }
        }
        HaPlan::Proceed {
            suspend: wants_suspend,
            options,
            warning,
        } => {
            if let Some(message) = warning {
                warn!("{}: {}", device.name, message);
                result.warn(WarningKind::HaState, message);
            }
            if wants_suspend {
                suspend(upgrader, &device, &inspection.session, &mut result).await;
            }
            let verdict = upgrader
                .upgrade(&mut device, inspection, options, &mut result)
                .await;
            UnitReport::Finished(result.finish(&device, verdict.outcome, verdict.reason))
        }
    }
}

/// Pass-2 unit for a deferred active member
pub async fn revisit(upgrader: &DeviceUpgrader, deferral: Deferral) -> DeviceResult {
    let Deferral { mut device, reason, .. } = deferral;
    debug!("{}: revisiting ({})", device.name, reason);

    let mut result = DeviceResult::start(&device, Pass::Revisit);
    if let Err(e) = device.revisit() {
        let verdict = upgrader.fail(&mut device, e);
        return result.finish(&device, verdict.outcome, verdict.reason);
    }

    let inspection = match upgrader.inspect(&mut device, &mut result).await {
        Ok(inspection) => inspection,
        Err(verdict) => return result.finish(&device, verdict.outcome, verdict.reason),
    };

    match wait_for_sync(upgrader, &device.name, &inspection.session, true).await {
        SyncStatus::Synced => {}
        SyncStatus::TimedOut(message) => {
            warn!("{}: {}, proceeding", device.name, message);
            result.warn(WarningKind::HaSync, message);
        }
        SyncStatus::Cancelled => {
            let verdict = upgrader.cancelled(&mut device);
            return result.finish(&device, verdict.outcome, verdict.reason);
        }
    }

    let local = device.current_version.unwrap_or_else(|| device.target_version());
    let (wants_suspend, options) = match plan(&inspection.facts, local, Pass::Revisit) {
        HaPlan::Proceed {
            suspend,
            options,
            warning,
        } => {
            if let Some(message) = warning {
                result.warn(WarningKind::HaState, message);
            }
            (suspend, options)
        }
        HaPlan::Defer { .. } => (false, UpgradeOptions::default()),
    };
    if wants_suspend {
        suspend(upgrader, &device, &inspection.session, &mut result).await;
    }

    let verdict = upgrader
        .upgrade(&mut device, inspection, options, &mut result)
        .await;
    result.finish(&device, verdict.outcome, verdict.reason)
}

/// Serial to peer serial, assembled from pass-1 reports
#[derive(Debug, Clone, Default)]
pub struct PairingTable {
    peers: HashMap<String, String>,
}

impl PairingTable {
    /// Record the peer of a device
    pub fn record(&mut self, serial: impl Into<String>, peer: impl Into<String>) {
        self.peers.insert(serial.into(), peer.into());
    }

    /// Get the peer of a device
    pub fn peer_of(&self, serial: &str) -> Option<&str> {
        self.peers.get(serial).map(String::as_str)
    }

    /// Number of devices with a known peer
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record the peer on a revisit result and flag a peer that did not succeed
    ///
    /// `peer_outcome` looks up the peer's pass-1 outcome, if it was part of
    /// the job.
    pub fn annotate(
        &self,
        result: &mut DeviceResult,
        peer_outcome: impl Fn(&str) -> Option<Outcome>,
    ) {
        let Some(peer) = self.peer_of(&result.serial) else {
            return;
        };
        result.peer_serial = Some(peer.to_string());

        match peer_outcome(peer) {
            Some(outcome) if outcome.is_success() => {}
            Some(outcome) => result.warn(
                WarningKind::Peer,
                format!("peer {peer} did not complete its upgrade ({outcome:?})"),
            ),
            None => debug!("{}: peer {} is not part of this job", result.name, peer),
        }
    }
}
