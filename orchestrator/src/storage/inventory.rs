//! Device inventory file

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::device::simulated::{SimulatedDevice, SimulatedFleet};
use crate::errors::UpgradeError;
use crate::models::device::{DeviceTarget, Endpoint};

/// Devices selected for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Devices to upgrade, in submission order
    #[serde(default)]
    pub devices: Vec<DeviceTarget>,

    /// Scripted appliances for a rehearsal run
    #[serde(default)]
    pub simulations: Vec<SimulatedDevice>,

    /// Versions offered by simulated appliances without their own offer list
    #[serde(default)]
    pub catalog: Vec<String>,
}

impl Inventory {
    /// Whether the run uses the simulated fleet instead of live appliances
    pub fn is_rehearsal(&self) -> bool {
        !self.simulations.is_empty()
    }

    /// Check that every device can be matched to its simulation
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.devices.is_empty() {
            return Err(UpgradeError::ValidationError(
                "inventory lists no devices".to_string(),
            ));
        }
        if !self.is_rehearsal() {
            return Ok(());
        }

        let simulated: HashSet<&str> = self
            .simulations
            .iter()
            .map(|sim| sim.serial.as_str())
            .collect();
        for device in &self.devices {
            let serial = match &device.endpoint {
                Endpoint::Proxied { serial, .. } => serial,
                Endpoint::Direct { .. } => &device.serial,
            };
            if !simulated.contains(serial.as_str()) {
                return Err(UpgradeError::ValidationError(format!(
                    "device {} ({}) has no simulation",
                    device.name, serial
                )));
            }
        }
        Ok(())
    }

    /// Build the simulated fleet for a rehearsal run
    pub fn fleet(&self) -> SimulatedFleet {
        SimulatedFleet::new(self.simulations.iter().cloned())
            .with_catalog(self.catalog.iter().cloned())
    }
}
