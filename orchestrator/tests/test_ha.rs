//! HA pair coordination across both scheduling passes

mod common;

use std::sync::Arc;

use fleet_models::HaMode;
use fwfleet::device::simulated::SimulatedDevice;
use fwfleet::models::result::{Outcome, Pass, WarningKind};
use fwfleet::upgrade::cancel::{CancelHandle, CancelSignal};
use fwfleet::upgrade::fsm::UpgradeState;
use fwfleet::upgrade::progress::{AttemptEvent, ProgressObserver, RetryPhase};
use fwfleet::upgrade::retry::OutcomeStatus;

use common::*;

fn pair(active: SimulatedDevice, passive: SimulatedDevice) -> Arc<fwfleet::device::simulated::SimulatedFleet> {
    fleet([active, passive])
}

fn active(version: &str) -> SimulatedDevice {
    ha_member("001", version, HaMode::Active, "002")
}

fn passive(version: &str) -> SimulatedDevice {
    ha_member("002", version, HaMode::Passive, "001")
}

#[tokio::test(start_paused = true)]
async fn test_pair_upgrades_passive_first_then_revisits_active() {
    let fleet = pair(
        SimulatedDevice {
            sync_after_polls: 4,
            ..active("10.1.3")
        },
        passive("10.1.3"),
    );
    let job = job(config("10.2.0"), &["001", "002"]);
    let recorder = Arc::new(Recorder::default());

    let report = run_with(&fleet, &job, recorder.clone(), CancelSignal::never()).await;

    // Submission order is kept even though fw-001 finished last
    let serials: Vec<&str> = report.results.iter().map(|r| r.serial.as_str()).collect();
    assert_eq!(serials, vec!["001", "002"]);

    let passive = report.result("002").unwrap();
    assert_eq!(passive.outcome, Outcome::Upgraded);
    assert_eq!(passive.pass, Pass::First);
    assert_eq!(passive.ha_mode, HaMode::Passive);
    assert!(passive.warnings.is_empty(), "{:?}", passive.warnings);

    let active = report.result("001").unwrap();
    assert_eq!(active.outcome, Outcome::Upgraded);
    assert_eq!(active.pass, Pass::Revisit);
    assert_eq!(active.peer_serial.as_deref(), Some("002"));
    assert!(active.warnings.is_empty(), "{:?}", active.warnings);
    assert_eq!(fleet.calls("001").install, 1);
    assert_eq!(fleet.calls("001").suspend, 1);
    assert_eq!(fleet.calls("002").suspend, 0);

    // The active member is only touched after its peer came back
    let peer_rebooted = first_event(&fleet, "002", "reboot").unwrap();
    let active_started = first_event(&fleet, "001", "suspend").unwrap();
    assert!(active_started > peer_rebooted);

    let states = recorder.states_of("fw-001");
    assert_eq!(
        &states[..4],
        &[
            UpgradeState::Connected,
            UpgradeState::VersionChecked,
            UpgradeState::Deferred,
            UpgradeState::Connected
        ]
    );
    assert_eq!(states.last(), Some(&UpgradeState::Done));

    // Revisit waited through the sync poll loop
    let sync_polls = recorder
        .attempts
        .lock()
        .unwrap()
        .iter()
        .filter(|(device, phase, _, _)| device == "fw-001" && *phase == RetryPhase::HaSync)
        .count();
    assert_eq!(sync_polls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_active_deferred_when_peer_already_on_target() {
    let fleet = pair(active("10.1.3"), passive("10.2.0"));
    let job = job(config("10.2.0"), &["001", "002"]);

    let report = run(&fleet, &job).await;

    let passive = report.result("002").unwrap();
    assert_eq!(passive.outcome, Outcome::NoUpgradeNeeded);

    let active = report.result("001").unwrap();
    assert_eq!(active.pass, Pass::Revisit);
    assert_eq!(active.outcome, Outcome::Upgraded);
    assert_eq!(report.results.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_active_with_older_peer_proceeds_in_first_pass() {
    let fleet = pair(active("10.1.3"), passive("10.0.9"));
    let job = job(config("10.2.0"), &["001"]);

    let report = run(&fleet, &job).await;

    let result = &report.results[0];
    assert_eq!(result.pass, Pass::First);
    assert_eq!(result.outcome, Outcome::Upgraded);
    assert_eq!(result.peer_serial.as_deref(), Some("002"));
    assert_eq!(fleet.calls("001").suspend, 1);
    assert_eq!(events_of(&fleet, "001")[0], "suspend");
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_suspend_is_advisory() {
    let fleet = pair(
        SimulatedDevice {
            suspend_unsupported: true,
            ..active("10.1.3")
        },
        passive("10.0.9"),
    );
    let job = job(config("10.2.0"), &["001"]);

    let report = run(&fleet, &job).await;

    let result = &report.results[0];
    assert_eq!(result.outcome, Outcome::Upgraded);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, WarningKind::HaSuspend);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_revisit_proceeds_when_sync_never_confirmed() {
    let fleet = pair(
        SimulatedDevice {
            never_syncs: true,
            ..active("10.1.3")
        },
        passive("10.1.3"),
    );
    let job = job(config("10.2.0"), &["001", "002"]);

    let report = run(&fleet, &job).await;

    let active = report.result("001").unwrap();
    assert_eq!(active.outcome, Outcome::Upgraded);
    assert_eq!(active.pass, Pass::Revisit);
    assert!(active
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::HaSync && w.message.contains("4 attempt(s)")));
}

#[tokio::test(start_paused = true)]
async fn test_passive_resync_timeout_is_a_warning() {
    let fleet = pair(
        active("10.1.3"),
        SimulatedDevice {
            never_syncs: true,
            ..passive("10.1.3")
        },
    );
    let job = job(config("10.2.0"), &["001", "002"]);

    let report = run(&fleet, &job).await;

    let passive = report.result("002").unwrap();
    assert_eq!(passive.outcome, Outcome::Upgraded);
    assert_eq!(passive.final_state, UpgradeState::Done);
    assert_eq!(passive.warnings.len(), 1);
    assert_eq!(passive.warnings[0].kind, WarningKind::HaSync);
}

#[tokio::test(start_paused = true)]
async fn test_failed_peer_is_flagged_on_revisit() {
    let fleet = pair(
        active("10.1.3"),
        SimulatedDevice {
            install_fatal: true,
            ..passive("10.1.3")
        },
    );
    let job = job(config("10.2.0"), &["001", "002"]);

    let report = run(&fleet, &job).await;

    assert_eq!(report.result("002").unwrap().outcome, Outcome::Failed);
    let active = report.result("001").unwrap();
    assert_eq!(active.pass, Pass::Revisit);
    assert!(active.warnings.iter().any(|w| w.kind == WarningKind::Peer));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_pair_never_suspends() {
    let fleet = pair(active("10.1.3"), passive("10.1.3"));
    let mut config = config("10.2.0");
    config.dry_run = true;
    let job = job(config, &["001", "002"]);

    let report = run(&fleet, &job).await;

    for serial in ["001", "002"] {
        assert_eq!(report.result(serial).unwrap().outcome, Outcome::DryRun);
        let calls = fleet.calls(serial);
        assert_eq!(calls.suspend, 0);
        assert_eq!(calls.install, 0);
        assert_eq!(calls.reboot, 0);
    }
    assert_eq!(report.result("001").unwrap().pass, Pass::Revisit);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_ha_mode_proceeds_with_warning() {
    let fleet = fleet([ha_member("001", "10.1.3", HaMode::Unknown, "002")]);
    let job = job(config("10.2.0"), &["001"]);

    let report = run(&fleet, &job).await;

    let result = &report.results[0];
    assert_eq!(result.outcome, Outcome::Upgraded);
    assert_eq!(result.warnings[0].kind, WarningKind::HaState);
}

/// Cancels the job when a device's HA sync wait first comes back unsynchronized
struct CancelOnSyncWait {
    handle: CancelHandle,
    device: &'static str,
}

impl ProgressObserver for CancelOnSyncWait {
    fn on_attempt(&self, event: &AttemptEvent<'_>) {
        if event.device == self.device
            && event.phase == RetryPhase::HaSync
            && event.status == OutcomeStatus::Retryable
        {
            self.handle.cancel();
        }
    }

    fn on_state(&self, _device: &str, _state: UpgradeState) {}
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_revisit_sync_wait() {
    let fleet = pair(
        SimulatedDevice {
            never_syncs: true,
            ..active("10.1.3")
        },
        passive("10.1.3"),
    );
    let job = job(config("10.2.0"), &["001", "002"]);
    let handle = CancelHandle::new();
    let observer = Arc::new(CancelOnSyncWait {
        handle: handle.clone(),
        device: "fw-001",
    });

    let report = run_with(&fleet, &job, observer, handle.signal()).await;

    assert_eq!(report.result("002").unwrap().outcome, Outcome::Upgraded);

    let active = report.result("001").unwrap();
    assert_eq!(active.pass, Pass::Revisit);
    assert_eq!(active.outcome, Outcome::Cancelled);
    assert_eq!(active.final_state, UpgradeState::Cancelled);
    assert_eq!(active.failed_in, Some(UpgradeState::VersionChecked));
    assert!(active.reason.contains("cancelled during"));

    let calls = fleet.calls("001");
    assert_eq!(calls.suspend, 0);
    assert_eq!(calls.download, 0);
    assert_eq!(calls.install, 0);
}
