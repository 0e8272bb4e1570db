//! Device models

use fleet_models::HaMode;
use serde::{Deserialize, Serialize};

use crate::models::job::JobConfig;
use crate::models::version::SoftwareVersion;
use crate::upgrade::fsm::{UpgradeFsm, UpgradeState};

/// How an appliance is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// Management address of the appliance itself
    Direct { address: String },

    /// Through a management proxy that relays to the appliance's serial
    Proxied { proxy: String, serial: String },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Direct { address } => write!(f, "{address}"),
            Endpoint::Proxied { proxy, serial } => write!(f, "{proxy} -> {serial}"),
        }
    }
}

/// A device selected for upgrade, as resolved by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub serial: String,
    pub name: String,
    pub endpoint: Endpoint,
}

/// Attempts made per retried phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAttempts {
    pub download: u32,
    pub install: u32,
    pub reboot: u32,
}

/// One managed appliance under upgrade
#[derive(Debug, Clone)]
pub struct Device {
    pub serial: String,
    pub name: String,
    pub endpoint: Endpoint,

    /// Last reported running version
    pub current_version: Option<SoftwareVersion>,

    target_version: SoftwareVersion,

    /// HA mode from the last facts query
    pub ha_mode: HaMode,

    pub attempts: PhaseAttempts,

    /// Configured attempt limits, mirrored from the job's policies
    pub limits: PhaseAttempts,

    dry_run: bool,
    fsm: UpgradeFsm,
}

impl Device {
    /// Build the device record at dispatch time
    pub fn dispatch(target: &DeviceTarget, config: &JobConfig) -> Self {
        Self {
            serial: target.serial.clone(),
            name: target.name.clone(),
            endpoint: target.endpoint.clone(),
            current_version: None,
            target_version: config.target_version,
            ha_mode: HaMode::Unknown,
            attempts: PhaseAttempts::default(),
            limits: PhaseAttempts {
                download: config.policies.download.max_tries,
                install: config.policies.install.max_tries,
                reboot: config.policies.reboot.max_tries,
            },
            dry_run: config.dry_run,
            fsm: UpgradeFsm::new(),
        }
    }

    /// Get the target version
    pub fn target_version(&self) -> SoftwareVersion {
        self.target_version
    }

    /// Whether the job stops before install
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Get current state
    pub fn state(&self) -> UpgradeState {
        self.fsm.state()
    }

    /// Get every state visited, in order
    pub fn history(&self) -> &[UpgradeState] {
        self.fsm.history()
    }

    pub(crate) fn advance(&mut self, next: UpgradeState) -> Result<(), String> {
        self.fsm.advance(next)
    }

    /// Return a deferred device to `Init` for its revisit pass
    pub(crate) fn revisit(&mut self) -> Result<(), String> {
        self.advance(UpgradeState::Init)?;
        self.attempts = PhaseAttempts::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::Credentials;

    #[test]
    fn test_dispatch_copies_config() {
        let mut config = JobConfig::new("10.2.0-h2".parse().unwrap(), Credentials::new("admin", "x"));
        config.dry_run = true;
        let target = DeviceTarget {
            serial: "007".to_string(),
            name: "fw1".to_string(),
            endpoint: Endpoint::Proxied {
                proxy: "panorama.example.net".to_string(),
                serial: "007".to_string(),
            },
        };

        let device = Device::dispatch(&target, &config);
        assert_eq!(device.target_version().to_string(), "10.2.0-h2");
        assert!(device.is_dry_run());
        assert_eq!(device.state(), UpgradeState::Init);
        assert_eq!(device.limits.reboot, 30);
        assert_eq!(device.endpoint.to_string(), "panorama.example.net -> 007");
    }

    #[test]
    fn test_endpoint_serde() {
        let endpoint: Endpoint =
            serde_json::from_str(r#"{"kind": "direct", "address": "10.0.0.1"}"#).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Direct {
                address: "10.0.0.1".to_string()
            }
        );
    }
}
