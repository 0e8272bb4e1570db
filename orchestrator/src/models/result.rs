//! Result models consumed by the caller

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_models::{ConfigBackup, DiffReport, HaMode, ReadinessReport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::device::{Device, PhaseAttempts};
use crate::models::version::SoftwareVersion;
use crate::upgrade::fsm::UpgradeState;
use crate::utils::opt_duration_secs_f64;

/// Scheduling pass a device ran in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    First,
    Revisit,
}

/// Terminal outcome of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Upgraded,
    NoUpgradeNeeded,
    DryRun,
    Failed,
    Cancelled,
}

impl Outcome {
    /// Whether the outcome counts as success for the exit code
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::Upgraded | Outcome::NoUpgradeNeeded | Outcome::DryRun
        )
    }
}

/// Category of an advisory warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// HA mode or peer could not be determined
    HaState,
    HaSuspend,
    HaSync,
    Snapshot,
    Readiness,
    Peer,
}

/// Advisory condition recorded on a device result, never escalated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

/// Per-device result record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResult {
    pub serial: String,
    pub name: String,
    pub outcome: Outcome,
    /// Human-readable explanation of the outcome
    pub reason: String,
    pub final_state: UpgradeState,

    /// Last non-terminal state before a failure or cancellation
    pub failed_in: Option<UpgradeState>,

    /// Pass in which the result was produced
    pub pass: Pass,
    pub ha_mode: HaMode,
    /// Serial of the HA peer, when paired
    pub peer_serial: Option<String>,

    /// Version reported before any upgrade work
    pub starting_version: Option<SoftwareVersion>,
    pub target_version: SoftwareVersion,

    /// Attempts used per retried phase
    pub attempts: PhaseAttempts,

    #[serde(with = "opt_duration_secs_f64", default)]
    pub download_elapsed: Option<Duration>,

    #[serde(with = "opt_duration_secs_f64", default)]
    pub reboot_elapsed: Option<Duration>,

    pub warnings: Vec<Warning>,
    /// Readiness check statuses, when checks ran
    pub readiness: Option<ReadinessReport>,
    /// Pre/post snapshot differences
    pub diff: Option<DiffReport>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backup: Option<ConfigBackup>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeviceResult {
    /// Open a result slot for a device about to run
    pub fn start(device: &Device, pass: Pass) -> Self {
        let now = Utc::now();
        Self {
            serial: device.serial.clone(),
            name: device.name.clone(),
            outcome: Outcome::Failed,
            reason: String::new(),
            final_state: device.state(),
            failed_in: None,
            pass,
            ha_mode: device.ha_mode,
            peer_serial: None,
            starting_version: device.current_version,
            target_version: device.target_version(),
            attempts: device.attempts,
            download_elapsed: None,
            reboot_elapsed: None,
            warnings: Vec::new(),
            readiness: None,
            diff: None,
            backup: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Result for a device that never ran because the job was cancelled
    pub fn cancelled_before_dispatch(device: &Device, pass: Pass) -> Self {
        let mut result = Self::start(device, pass);
        result.outcome = Outcome::Cancelled;
        result.reason = "job cancelled before the device was dispatched".to_string();
        result
    }

    /// Record an advisory warning
    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            message: message.into(),
        });
    }

    /// Seal the result with the device's terminal state
    pub fn finish(mut self, device: &Device, outcome: Outcome, reason: impl Into<String>) -> Self {
        self.outcome = outcome;
        self.reason = reason.into();
        self.final_state = device.state();
        self.ha_mode = device.ha_mode;
        self.attempts = device.attempts;
        if self.starting_version.is_none() {
            self.starting_version = device.current_version;
        }
        if matches!(outcome, Outcome::Failed | Outcome::Cancelled) {
            self.failed_in = device
                .history()
                .iter()
                .rev()
                .find(|state| !state.is_terminal())
                .copied();
        }
        self.finished_at = Utc::now();
        self
    }
}

/// Outcome counts across a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub upgraded: usize,
    pub no_upgrade_needed: usize,
    pub dry_run: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Devices carrying at least one warning
    pub with_warnings: usize,
}

/// Aggregated outcome of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// One result per submitted device, in submission order
    pub results: Vec<DeviceResult>,
}

impl JobReport {
    /// Whether any device failed or was cancelled
    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|r| !r.outcome.is_success())
    }

    /// Count results per outcome
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for result in &self.results {
            match result.outcome {
                Outcome::Upgraded => counts.upgraded += 1,
                Outcome::NoUpgradeNeeded => counts.no_upgrade_needed += 1,
                Outcome::DryRun => counts.dry_run += 1,
                Outcome::Failed => counts.failed += 1,
                Outcome::Cancelled => counts.cancelled += 1,
            }
            if !result.warnings.is_empty() {
                counts.with_warnings += 1;
            }
        }
        counts
    }

    /// Process exit status for the job
    pub fn exit_code(&self) -> i32 {
        if self.any_failed() {
            1
        } else {
            0
        }
    }

    /// Get the result for a serial
    pub fn result(&self, serial: &str) -> Option<&DeviceResult> {
        self.results.iter().find(|r| r.serial == serial)
    }
}
