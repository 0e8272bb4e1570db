//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::logs::LogLevel;
use crate::models::job::{Credentials, JobConfig, PhasePolicies, Timeouts, DEFAULT_CONCURRENCY};
use crate::models::version::SoftwareVersion;

/// Environment variable holding the appliance password
pub const PASSWORD_ENV: &str = "FWFLEET_PASSWORD";

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Directory for the log file; stdout only when absent
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Firmware version to upgrade to, e.g. `10.2.0-h2`
    #[serde(default)]
    pub target_version: String,

    /// Devices upgraded at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry policies per phase
    #[serde(default)]
    pub policies: PhasePolicies,

    /// Pause between the base image and target image downloads, in seconds
    #[serde(default = "default_download_settle")]
    pub download_settle_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub readiness_checks: Vec<String>,

    /// Fail a device when any readiness check fails
    #[serde(default)]
    pub readiness_blocking: bool,

    /// Snapshot categories; empty disables snapshots
    #[serde(default)]
    pub snapshot_categories: Vec<String>,

    /// Stop every device after the configuration backup
    #[serde(default)]
    pub dry_run: bool,

    /// Appliance API user; the password comes from `FWFLEET_PASSWORD`
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_download_settle() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    120
}

fn default_username() -> String {
    "admin".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            target_version: String::new(),
            concurrency: default_concurrency(),
            policies: PhasePolicies::default(),
            download_settle_secs: default_download_settle(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            readiness_checks: Vec::new(),
            readiness_blocking: false,
            snapshot_categories: Vec::new(),
            dry_run: false,
            username: default_username(),
        }
    }
}

impl Settings {
    /// Build the immutable job configuration
    ///
    /// The password is taken as given and never stored in the settings.
    pub fn to_job_config(&self, password: impl Into<String>) -> Result<JobConfig, UpgradeError> {
        if self.target_version.trim().is_empty() {
            return Err(UpgradeError::ConfigError(
                "target_version is not set".to_string(),
            ));
        }
        let target: SoftwareVersion = self.target_version.parse()?;

        let mut config = JobConfig::new(target, Credentials::new(&self.username, password));
        config.concurrency = self.concurrency;
        config.policies = self.policies;
        config.download_settle = Duration::from_secs(self.download_settle_secs);
        config.timeouts = Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            command: Duration::from_secs(self.command_timeout_secs),
        };
        config.readiness_checks = self.readiness_checks.clone();
        config.readiness_blocking = self.readiness_blocking;
        config.snapshot_categories = self.snapshot_categories.clone();
        config.dry_run = self.dry_run;

        config.validate()?;
        Ok(config)
    }
}

/// Read the appliance password from the environment
pub fn password_from_env() -> Result<String, UpgradeError> {
    std::env::var(PASSWORD_ENV)
        .map_err(|_| UpgradeError::ConfigError(format!("{PASSWORD_ENV} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.concurrency, 10);
        assert_eq!(settings.policies.reboot.max_tries, 30);
        assert_eq!(settings.policies.reboot.interval, Duration::from_secs(60));
        assert_eq!(settings.policies.ha_sync.max_tries, 10);
        assert_eq!(settings.download_settle_secs, 60);
        assert_eq!(settings.username, "admin");
        assert!(settings.log_dir.is_none());
    }

    #[test]
    fn test_partial_policies_keep_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "target_version": "10.2.0-h2",
                "policies": {"install": {"max_tries": 5, "interval_secs": 0}},
                "readiness_checks": ["ntp_sync", "free_disk_space"],
                "readiness_blocking": true
            }"#,
        )
        .unwrap();

        let config = settings.to_job_config("secret").unwrap();
        assert_eq!(config.target_version.to_string(), "10.2.0-h2");
        assert_eq!(config.policies.install.max_tries, 5);
        assert_eq!(config.policies.install.interval, Duration::ZERO);
        assert_eq!(config.policies.download.max_tries, 3);
        assert_eq!(config.timeouts.command, Duration::from_secs(120));
        assert!(config.readiness_blocking);
        assert_eq!(config.readiness_checks.len(), 2);
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = Settings::default().to_job_config("secret").unwrap_err();
        assert!(matches!(err, UpgradeError::ConfigError(_)));
    }

    #[test]
    fn test_bad_target_rejected() {
        let settings = Settings {
            target_version: "ten".to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.to_job_config("secret"),
            Err(UpgradeError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_zero_tries_rejected() {
        let mut settings = Settings {
            target_version: "10.2.0".to_string(),
            ..Settings::default()
        };
        settings.policies.reboot.max_tries = 0;
        assert!(matches!(
            settings.to_job_config("secret"),
            Err(UpgradeError::ConfigError(_))
        ));
    }
}
