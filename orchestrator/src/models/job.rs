//! Job configuration models

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::UpgradeError;
use crate::models::device::DeviceTarget;
use crate::models::version::SoftwareVersion;
use crate::utils::duration_secs;

/// Default number of devices upgraded at once
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Bounded retry policy for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_tries: u32,

    /// Delay between attempts; zero retries immediately
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a retry policy
    pub const fn new(max_tries: u32, interval: Duration) -> Self {
        Self {
            max_tries,
            interval,
        }
    }

    fn validate(&self, phase: &str) -> Result<(), UpgradeError> {
        if self.max_tries < 1 {
            return Err(UpgradeError::ConfigError(format!(
                "{phase} retry policy: max_tries must be at least 1, got {}",
                self.max_tries
            )));
        }
        Ok(())
    }
}

/// Retry policies per phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePolicies {
    /// Image downloads, base and target
    pub download: RetryPolicy,
    /// Image install
    pub install: RetryPolicy,

    /// Post-reboot reachability and version polling
    pub reboot: RetryPolicy,

    /// Pre- and post-upgrade snapshots
    pub snapshot: RetryPolicy,

    /// HA synchronization polling (revisit wait and passive resync)
    pub ha_sync: RetryPolicy,
}

impl Default for PhasePolicies {
    fn default() -> Self {
        Self {
            download: RetryPolicy::new(3, Duration::from_secs(60)),
            install: RetryPolicy::new(3, Duration::from_secs(60)),
            reboot: RetryPolicy::new(30, Duration::from_secs(60)),
            snapshot: RetryPolicy::new(3, Duration::from_secs(30)),
            ha_sync: RetryPolicy::new(10, Duration::from_secs(10)),
        }
    }
}

/// Device client call timeouts, passed through untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Session establishment
    pub connect: Duration,
    /// Single API command
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(120),
        }
    }
}

/// Appliance API credentials
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    /// Never logged or serialized
    pub password: SecretString,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Immutable configuration of one upgrade run
#[derive(Debug)]
pub struct JobConfig {
    pub target_version: SoftwareVersion,
    /// Devices worked on at once
    pub concurrency: usize,
    pub policies: PhasePolicies,

    /// Pause between the base image and the target image downloads
    pub download_settle: Duration,

    pub timeouts: Timeouts,
    pub credentials: Credentials,
    /// Readiness checks run before the backup
    pub readiness_checks: Vec<String>,

    /// A failed readiness check aborts the device's upgrade
    pub readiness_blocking: bool,

    pub snapshot_categories: Vec<String>,

    /// Stop after the configuration backup
    pub dry_run: bool,
}

impl JobConfig {
    /// Create a config with default policies and timeouts
    pub fn new(target_version: SoftwareVersion, credentials: Credentials) -> Self {
        Self {
            target_version,
            concurrency: DEFAULT_CONCURRENCY,
            policies: PhasePolicies::default(),
            download_settle: Duration::from_secs(60),
            timeouts: Timeouts::default(),
            credentials,
            readiness_checks: Vec::new(),
            readiness_blocking: false,
            snapshot_categories: Vec::new(),
            dry_run: false,
        }
    }

    /// Reject out-of-range values before any device work begins
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.concurrency < 1 {
            return Err(UpgradeError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let policies = &self.policies;
        policies.download.validate("download")?;
        policies.install.validate("install")?;
        policies.reboot.validate("reboot")?;
        policies.snapshot.validate("snapshot")?;
        policies.ha_sync.validate("ha_sync")?;

        if let Some(name) = self
            .readiness_checks
            .iter()
            .chain(&self.snapshot_categories)
            .find(|name| name.trim().is_empty())
        {
            return Err(UpgradeError::ConfigError(format!(
                "check and snapshot names must not be empty: {name:?}"
            )));
        }

        if self.credentials.username.trim().is_empty() {
            return Err(UpgradeError::ConfigError(
                "credentials username must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// One invocation of the orchestrator
#[derive(Debug)]
pub struct UpgradeJob {
    pub id: Uuid,
    pub config: Arc<JobConfig>,
    /// Devices in submission order
    pub targets: Vec<DeviceTarget>,
}

impl UpgradeJob {
    /// Create a job after validating the configuration and device list
    pub fn new(config: JobConfig, targets: Vec<DeviceTarget>) -> Result<Self, UpgradeError> {
        let job = Self {
            id: Uuid::new_v4(),
            config: Arc::new(config),
            targets,
        };
        job.validate()?;
        Ok(job)
    }

    /// Check the configuration and that every target has a unique, non-empty serial
    pub fn validate(&self) -> Result<(), UpgradeError> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.serial.trim().is_empty() {
                return Err(UpgradeError::ValidationError(format!(
                    "device {:?} has an empty serial number",
                    target.name
                )));
            }
            if !seen.insert(target.serial.as_str()) {
                return Err(UpgradeError::ValidationError(format!(
                    "duplicate device serial: {}",
                    target.serial
                )));
            }
        }
        Ok(())
    }
}
