//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_models::HaMode;
use fwfleet::device::simulated::{SimulatedDevice, SimulatedFleet, SimulatedHa};
use fwfleet::models::device::{DeviceTarget, Endpoint};
use fwfleet::models::job::{Credentials, JobConfig, RetryPolicy, UpgradeJob};
use fwfleet::models::result::JobReport;
use fwfleet::upgrade::cancel::CancelSignal;
use fwfleet::upgrade::fsm::UpgradeState;
use fwfleet::upgrade::progress::{AttemptEvent, NoopProgress, ProgressObserver, RetryPhase};
use fwfleet::upgrade::retry::OutcomeStatus;
use fwfleet::BatchScheduler;

pub const CATALOG: [&str; 4] = ["10.1.3", "10.2.0", "10.2.0-h2", "10.2.1"];

pub fn appliance(serial: &str, version: &str) -> SimulatedDevice {
    SimulatedDevice {
        serial: serial.to_string(),
        hostname: format!("fw-{serial}"),
        version: version.to_string(),
        ..Default::default()
    }
}

pub fn ha_member(serial: &str, version: &str, mode: HaMode, peer: &str) -> SimulatedDevice {
    SimulatedDevice {
        ha: Some(SimulatedHa {
            mode,
            peer: peer.to_string(),
        }),
        ..appliance(serial, version)
    }
}

pub fn target(serial: &str) -> DeviceTarget {
    DeviceTarget {
        serial: serial.to_string(),
        name: format!("fw-{serial}"),
        endpoint: Endpoint::Direct {
            address: serial.to_string(),
        },
    }
}

pub fn fleet(devices: impl IntoIterator<Item = SimulatedDevice>) -> Arc<SimulatedFleet> {
    Arc::new(SimulatedFleet::new(devices).with_catalog(CATALOG))
}

/// Short policies so paused-clock tests stay readable
pub fn config(target_version: &str) -> JobConfig {
    let mut config = JobConfig::new(
        target_version.parse().unwrap(),
        Credentials::new("admin", "secret"),
    );
    config.policies.download = RetryPolicy::new(3, Duration::from_secs(10));
    config.policies.install = RetryPolicy::new(3, Duration::from_secs(10));
    config.policies.reboot = RetryPolicy::new(5, Duration::from_secs(30));
    config.policies.snapshot = RetryPolicy::new(2, Duration::from_secs(5));
    config.policies.ha_sync = RetryPolicy::new(4, Duration::from_secs(10));
    config.download_settle = Duration::from_secs(20);
    config.snapshot_categories = vec!["routing".to_string(), "sessions".to_string()];
    config.readiness_checks = vec!["ntp_sync".to_string(), "free_disk_space".to_string()];
    config
}

pub fn job(config: JobConfig, serials: &[&str]) -> UpgradeJob {
    UpgradeJob::new(config, serials.iter().map(|s| target(s)).collect()).unwrap()
}

pub async fn run(fleet: &Arc<SimulatedFleet>, job: &UpgradeJob) -> JobReport {
    BatchScheduler::new(fleet.clone(), fleet.clone())
        .with_progress(Arc::new(NoopProgress))
        .run_job(job)
        .await
        .unwrap()
}

pub async fn run_with(
    fleet: &Arc<SimulatedFleet>,
    job: &UpgradeJob,
    progress: Arc<dyn ProgressObserver>,
    cancel: CancelSignal,
) -> JobReport {
    BatchScheduler::new(fleet.clone(), fleet.clone())
        .with_progress(progress)
        .with_cancel(cancel)
        .run_job(job)
        .await
        .unwrap()
}

/// Mutating calls made on one device, in order
pub fn events_of(fleet: &SimulatedFleet, serial: &str) -> Vec<String> {
    let prefix = format!("{serial}:");
    fleet
        .events()
        .into_iter()
        .filter_map(|event| event.strip_prefix(&prefix).map(str::to_string))
        .collect()
}

/// Position of the first `serial:op` event in the fleet-wide log
pub fn first_event(fleet: &SimulatedFleet, serial: &str, op: &str) -> Option<usize> {
    let wanted = format!("{serial}:{op}");
    fleet.events().iter().position(|event| *event == wanted)
}

/// Records progress callbacks
#[derive(Default)]
pub struct Recorder {
    pub attempts: Mutex<Vec<(String, RetryPhase, u32, OutcomeStatus)>>,
    pub states: Mutex<Vec<(String, UpgradeState)>>,
}

impl Recorder {
    pub fn states_of(&self, device: &str) -> Vec<UpgradeState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == device)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl ProgressObserver for Recorder {
    fn on_attempt(&self, event: &AttemptEvent<'_>) {
        self.attempts.lock().unwrap().push((
            event.device.to_string(),
            event.phase,
            event.attempt,
            event.status,
        ));
    }

    fn on_state(&self, device: &str, state: UpgradeState) {
        self.states.lock().unwrap().push((device.to_string(), state));
    }
}
