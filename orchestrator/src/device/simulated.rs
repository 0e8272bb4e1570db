//! In-memory simulated fleet
//!
//! Implements [`DeviceClient`] and [`AssuranceProvider`] from scripted device
//! descriptions. Used for rehearsal runs of the binary and by the tests, which
//! inspect the recorded calls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use fleet_models::{
    CheckStatus, ConfigBackup, DeviceFacts, DiffReport, HaInfo, HaMode, ImageStatus, PeerInfo,
    ReadinessReport, Snapshot,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::client::{AssuranceProvider, DeviceClient, Session};
use crate::models::device::Endpoint;
use crate::models::job::{Credentials, Timeouts};
use crate::models::version::SoftwareVersion;
use crate::upgrade::retry::PhaseOutcome;

/// HA membership of a simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedHa {
    pub mode: HaMode,
    /// Serial of the peer appliance
    pub peer: String,
}

/// Scripted behaviour of one simulated appliance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDevice {
    pub serial: String,
    pub hostname: String,

    /// Management address; the serial is used when empty
    pub address: String,

    pub version: String,
    /// HA pairing; standalone when absent
    pub ha: Option<SimulatedHa>,

    /// Versions the device offers; empty falls back to the fleet catalog
    pub offered: Vec<String>,

    /// Versions already downloaded
    pub downloaded: Vec<String>,

    pub auth_rejected: bool,

    /// Retryable download failures before the first success
    pub download_failures: u32,

    /// "image manager busy" responses before the install succeeds
    pub install_busy: u32,

    /// Reject every install as a validation failure
    pub install_fatal: bool,

    /// Failed connects after a reboot before the device answers again
    pub offline_polls: u32,

    /// Version the device boots into, overriding the installed one
    pub boots_into: Option<String>,

    /// Reject HA suspend
    pub suspend_unsupported: bool,

    /// Facts queries before the HA configuration reports as synchronized
    pub sync_after_polls: u32,

    /// Never report the HA configuration as synchronized
    pub never_syncs: bool,

    /// Retryable snapshot failures before the first success
    pub snapshot_failures: u32,

    /// Retryable snapshot failures once the device has rebooted
    pub post_snapshot_failures: u32,

    /// Readiness checks reported as failed
    pub failing_checks: Vec<String>,
}

/// Calls received per device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: u32,
    pub facts: u32,
    pub images: u32,
    pub download: u32,
    pub export: u32,
    pub install: u32,
    pub reboot: u32,
    pub suspend: u32,
    pub snapshot: u32,
    pub checks: u32,
}

#[derive(Debug)]
struct SimState {
    spec: SimulatedDevice,
    version: String,
    mode: HaMode,
    downloaded: HashSet<String>,
    installed: Option<String>,
    offline_left: u32,
    download_failures_left: u32,
    install_busy_left: u32,
    snapshot_failures_left: u32,
    post_snapshot_failures_left: u32,
    rebooted: bool,
    sync_polls: u32,
    calls: CallCounts,
}

impl SimState {
    fn new(spec: SimulatedDevice) -> Self {
        Self {
            version: spec.version.clone(),
            mode: spec.ha.as_ref().map(|ha| ha.mode).unwrap_or(HaMode::None),
            downloaded: spec.downloaded.iter().cloned().collect(),
            installed: None,
            offline_left: 0,
            download_failures_left: spec.download_failures,
            install_busy_left: spec.install_busy,
            snapshot_failures_left: spec.snapshot_failures,
            post_snapshot_failures_left: spec.post_snapshot_failures,
            rebooted: false,
            sync_polls: 0,
            calls: CallCounts::default(),
            spec,
        }
    }

    fn offered<'a>(&'a self, catalog: &'a [String]) -> &'a [String] {
        if self.spec.offered.is_empty() {
            catalog
        } else {
            &self.spec.offered
        }
    }
}

#[derive(Debug, Default)]
struct FleetState {
    devices: HashMap<String, SimState>,
    catalog: Vec<String>,
    events: Vec<String>,
}

/// Simulated appliances sharing one view of the fleet
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    state: Mutex<FleetState>,
}

impl SimulatedFleet {
    /// Create a fleet from device descriptions
    pub fn new(devices: impl IntoIterator<Item = SimulatedDevice>) -> Self {
        let devices = devices
            .into_iter()
            .map(|spec| (spec.serial.clone(), SimState::new(spec)))
            .collect();
        Self {
            state: Mutex::new(FleetState {
                devices,
                catalog: Vec::new(),
                events: Vec::new(),
            }),
        }
    }

    /// Versions offered by every device that has no offer list of its own
    pub fn with_catalog<S: Into<String>>(self, versions: impl IntoIterator<Item = S>) -> Self {
        self.lock().catalog = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Get the calls made on a device so far
    pub fn calls(&self, serial: &str) -> CallCounts {
        self.lock()
            .devices
            .get(serial)
            .map(|d| d.calls)
            .unwrap_or_default()
    }

    /// Mutating calls across the fleet as `serial:operation`, in call order
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    /// Currently running version of a device
    pub fn version_of(&self, serial: &str) -> Option<String> {
        self.lock().devices.get(serial).map(|d| d.version.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FleetState> {
        // A poisoned lock only means a test thread panicked mid-call
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the session's device, recording `op` in the event log
    fn with_device<T>(
        &self,
        session: &Session,
        op: &str,
        f: impl FnOnce(&mut SimState, &[String]) -> PhaseOutcome<T>,
    ) -> PhaseOutcome<T> {
        let mut fleet = self.lock();
        let FleetState {
            devices,
            catalog,
            events,
        } = &mut *fleet;
        events.push(format!("{}:{}", session.serial, op));
        match devices.get_mut(&session.serial) {
            Some(device) => f(device, catalog),
            None => PhaseOutcome::Fatal(format!("unknown device {}", session.serial)),
        }
    }
}

#[async_trait]
impl DeviceClient for SimulatedFleet {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
        _timeouts: &Timeouts,
    ) -> PhaseOutcome<Session> {
        let mut fleet = self.lock();
        let device = fleet.devices.values_mut().find(|d| match endpoint {
            Endpoint::Proxied { serial, .. } => &d.spec.serial == serial,
            Endpoint::Direct { address } => {
                &d.spec.address == address || (d.spec.address.is_empty() && &d.spec.serial == address)
            }
        });
        let Some(device) = device else {
            return PhaseOutcome::Fatal(format!("no appliance answers at {endpoint}"));
        };

        device.calls.connect += 1;
        if device.spec.auth_rejected {
            return PhaseOutcome::Fatal("authentication rejected".to_string());
        }
        if device.offline_left > 0 {
            device.offline_left -= 1;
            return PhaseOutcome::Retryable("connection refused".to_string());
        }

        debug!("Simulated connect to {}", device.spec.serial);
        PhaseOutcome::Success(Session {
            serial: device.spec.serial.clone(),
            handle: format!("sim-{}", device.calls.connect),
        })
    }

    async fn facts(&self, session: &Session) -> PhaseOutcome<DeviceFacts> {
        let mut fleet = self.lock();
        let Some(device) = fleet.devices.get_mut(&session.serial) else {
            return PhaseOutcome::Fatal(format!("unknown device {}", session.serial));
        };

        device.calls.facts += 1;
        device.sync_polls += 1;
        let synced = !device.spec.never_syncs && device.sync_polls > device.spec.sync_after_polls;
        let ha_spec = device.spec.ha.clone();
        let mode = device.mode;
        let mut facts = DeviceFacts {
            hostname: device.spec.hostname.clone(),
            serial: device.spec.serial.clone(),
            version: device.version.clone(),
            ha: None,
        };

        if let Some(ha) = ha_spec {
            let peer = fleet.devices.get(&ha.peer).map(|peer| PeerInfo {
                serial: peer.spec.serial.clone(),
                version: peer.version.clone(),
                mode: peer.mode,
            });
            facts.ha = Some(HaInfo {
                mode,
                peer,
                config_synced: synced,
            });
        }

        PhaseOutcome::Success(facts)
    }

    async fn available_images(&self, session: &Session) -> PhaseOutcome<Vec<ImageStatus>> {
        let mut fleet = self.lock();
        let FleetState {
            devices, catalog, ..
        } = &mut *fleet;
        let Some(device) = devices.get_mut(&session.serial) else {
            return PhaseOutcome::Fatal(format!("unknown device {}", session.serial));
        };
        device.calls.images += 1;

        let mut versions: Vec<String> = device
            .offered(catalog)
            .iter()
            .chain(device.downloaded.iter())
            .cloned()
            .collect();
        versions.sort();
        versions.dedup();

        PhaseOutcome::Success(
            versions
                .into_iter()
                .map(|version| ImageStatus {
                    downloaded: device.downloaded.contains(&version),
                    version,
                })
                .collect(),
        )
    }

    async fn download_image(&self, session: &Session, version: &SoftwareVersion) -> PhaseOutcome<()> {
        let version = version.to_string();
        self.with_device(session, &format!("download:{version}"), |device, catalog| {
            device.calls.download += 1;
            if !device.offered(catalog).contains(&version) {
                return PhaseOutcome::Fatal(format!("version {version} is not offered"));
            }
            if device.download_failures_left > 0 {
                device.download_failures_left -= 1;
                return PhaseOutcome::Retryable("download job failed".to_string());
            }
            device.downloaded.insert(version);
            PhaseOutcome::Success(())
        })
    }

    async fn export_config(&self, session: &Session) -> PhaseOutcome<ConfigBackup> {
        self.with_device(session, "export", |device, _| {
            device.calls.export += 1;
            PhaseOutcome::Success(ConfigBackup {
                captured_at: Utc::now(),
                content: format!("<config serial=\"{}\"/>", device.spec.serial),
            })
        })
    }

    async fn install_image(&self, session: &Session, version: &SoftwareVersion) -> PhaseOutcome<()> {
        let version = version.to_string();
        self.with_device(session, "install", |device, _| {
            device.calls.install += 1;
            if device.spec.install_fatal {
                return PhaseOutcome::Fatal("image validation failed".to_string());
            }
            if device.install_busy_left > 0 {
                device.install_busy_left -= 1;
                return PhaseOutcome::Retryable("image manager busy".to_string());
            }
            if !device.downloaded.contains(&version) {
                return PhaseOutcome::Fatal(format!("image {version} is not downloaded"));
            }
            device.installed = Some(version);
            PhaseOutcome::Success(())
        })
    }

    async fn reboot(&self, session: &Session) -> PhaseOutcome<()> {
        self.with_device(session, "reboot", |device, _| {
            device.calls.reboot += 1;
            if let Some(next) = device
                .spec
                .boots_into
                .clone()
                .or_else(|| device.installed.clone())
            {
                device.version = next;
            }
            device.offline_left = device.spec.offline_polls;
            device.sync_polls = 0;
            device.rebooted = true;
            PhaseOutcome::Success(())
        })
    }

    async fn suspend_ha(&self, session: &Session) -> PhaseOutcome<()> {
        self.with_device(session, "suspend", |device, _| {
            device.calls.suspend += 1;
            if device.spec.suspend_unsupported || device.spec.ha.is_none() {
                return PhaseOutcome::Fatal("HA suspension is not supported".to_string());
            }
            device.mode = HaMode::NonFunctional;
            PhaseOutcome::Success(())
        })
    }
}

#[async_trait]
impl AssuranceProvider for SimulatedFleet {
    async fn snapshot(&self, session: &Session, categories: &[String]) -> PhaseOutcome<Snapshot> {
        self.with_device(session, "snapshot", |device, _| {
            device.calls.snapshot += 1;
            let failures_left = if device.rebooted {
                &mut device.post_snapshot_failures_left
            } else {
                &mut device.snapshot_failures_left
            };
            if *failures_left > 0 {
                *failures_left -= 1;
                return PhaseOutcome::Retryable("snapshot collection timed out".to_string());
            }
            let data = categories
                .iter()
                .map(|c| (c.clone(), serde_json::json!({ "serial": device.spec.serial })))
                .collect();
            PhaseOutcome::Success(Snapshot {
                captured_at: Utc::now(),
                categories: categories.to_vec(),
                data,
            })
        })
    }

    async fn run_checks(&self, session: &Session, checks: &[String]) -> ReadinessReport {
        let mut fleet = self.lock();
        let Some(device) = fleet.devices.get_mut(&session.serial) else {
            return checks
                .iter()
                .map(|c| (c.clone(), CheckStatus::Skip))
                .collect();
        };
        device.calls.checks += 1;

        checks
            .iter()
            .map(|check| {
                let status = if device.spec.failing_checks.contains(check) {
                    CheckStatus::Fail
                } else {
                    CheckStatus::Pass
                };
                (check.clone(), status)
            })
            .collect()
    }

    async fn diff(&self, pre: &Snapshot, post: &Snapshot) -> DiffReport {
        let mut changes = BTreeMap::new();
        for category in &pre.categories {
            let before = pre.data.get(category);
            let after = post.data.get(category);
            let entry: &mut Vec<String> = changes.entry(category.clone()).or_default();
            if before != after {
                entry.push(format!("{category} changed"));
            }
        }
        DiffReport { changes }
    }
}
