//! Worker pool, result ordering and cancellation

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_models::{ConfigBackup, DeviceFacts, ImageStatus};
use fwfleet::device::client::{DeviceClient, Session};
use fwfleet::device::simulated::{SimulatedDevice, SimulatedFleet};
use fwfleet::models::device::Endpoint;
use fwfleet::models::job::{Credentials, Timeouts, UpgradeJob};
use fwfleet::models::result::{Outcome, Pass};
use fwfleet::models::version::SoftwareVersion;
use fwfleet::upgrade::cancel::CancelHandle;
use fwfleet::upgrade::fsm::UpgradeState;
use fwfleet::upgrade::progress::{AttemptEvent, NoopProgress, ProgressObserver, RetryPhase};
use fwfleet::upgrade::retry::{OutcomeStatus, PhaseOutcome};
use fwfleet::{BatchScheduler, UpgradeError};

use common::*;

/// Tracks how many installs run at the same time
struct InstallGauge {
    inner: Arc<SimulatedFleet>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl DeviceClient for InstallGauge {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeouts: &Timeouts,
    ) -> PhaseOutcome<Session> {
        self.inner.connect(endpoint, credentials, timeouts).await
    }

    async fn facts(&self, session: &Session) -> PhaseOutcome<DeviceFacts> {
        self.inner.facts(session).await
    }

    async fn available_images(&self, session: &Session) -> PhaseOutcome<Vec<ImageStatus>> {
        self.inner.available_images(session).await
    }

    async fn download_image(&self, session: &Session, version: &SoftwareVersion) -> PhaseOutcome<()> {
        self.inner.download_image(session, version).await
    }

    async fn export_config(&self, session: &Session) -> PhaseOutcome<ConfigBackup> {
        self.inner.export_config(session).await
    }

    async fn install_image(&self, session: &Session, version: &SoftwareVersion) -> PhaseOutcome<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let outcome = self.inner.install_image(session, version).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn reboot(&self, session: &Session) -> PhaseOutcome<()> {
        self.inner.reboot(session).await
    }

    async fn suspend_ha(&self, session: &Session) -> PhaseOutcome<()> {
        self.inner.suspend_ha(session).await
    }
}

/// Cancels the job once a device reaches a given state
struct CancelAt {
    handle: CancelHandle,
    device: &'static str,
    state: UpgradeState,
}

impl ProgressObserver for CancelAt {
    fn on_attempt(&self, _event: &AttemptEvent<'_>) {}

    fn on_state(&self, device: &str, state: UpgradeState) {
        if device == self.device && state == self.state {
            self.handle.cancel();
        }
    }
}

/// Cancels the job on the first retryable install attempt
struct CancelOnBusyInstall(CancelHandle);

impl ProgressObserver for CancelOnBusyInstall {
    fn on_attempt(&self, event: &AttemptEvent<'_>) {
        if event.phase == RetryPhase::Install && event.status == OutcomeStatus::Retryable {
            self.0.cancel();
        }
    }

    fn on_state(&self, _device: &str, _state: UpgradeState) {}
}

#[tokio::test(start_paused = true)]
async fn test_one_result_per_device_in_submission_order() {
    let fleet = fleet([
        appliance("001", "10.1.3"),
        appliance("002", "10.2.0"),
        SimulatedDevice {
            install_fatal: true,
            ..appliance("003", "10.1.3")
        },
        appliance("004", "10.1.3"),
        appliance("005", "10.2.1"),
    ]);
    let mut config = config("10.2.0");
    config.concurrency = 2;
    let job = job(config, &["005", "003", "001", "004", "002"]);

    let report = run(&fleet, &job).await;

    let serials: Vec<&str> = report.results.iter().map(|r| r.serial.as_str()).collect();
    assert_eq!(serials, vec!["005", "003", "001", "004", "002"]);
    assert!(report.results.iter().all(|r| r.pass == Pass::First));

    let counts = report.counts();
    assert_eq!(counts.upgraded, 2);
    assert_eq!(counts.no_upgrade_needed, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(report.exit_code(), 1);
    assert!(report.finished_at >= report.started_at);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_bounds_concurrent_devices() {
    let sim = fleet((1..=5).map(|n| appliance(&format!("00{n}"), "10.1.3")));
    let gauge = Arc::new(InstallGauge {
        inner: sim.clone(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let mut config = config("10.2.0");
    config.concurrency = 2;
    let job = job(config, &["001", "002", "003", "004", "005"]);

    let report = BatchScheduler::new(gauge.clone(), sim.clone())
        .with_progress(Arc::new(NoopProgress))
        .run_job(&job)
        .await
        .unwrap();

    assert_eq!(report.counts().upgraded, 5);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_dispatches_nothing() {
    let fleet = fleet([appliance("001", "10.1.3"), appliance("002", "10.1.3")]);
    let job = job(config("10.2.0"), &["001", "002"]);
    let handle = CancelHandle::new();
    handle.cancel();

    let report = run_with(&fleet, &job, Arc::new(NoopProgress), handle.signal()).await;

    assert_eq!(report.results.len(), 2);
    for result in &report.results {
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert_eq!(result.final_state, UpgradeState::Cancelled);
        assert_eq!(fleet.calls(&result.serial).connect, 0);
    }
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_job_skips_undispatched_devices() {
    let fleet = fleet([
        appliance("001", "10.1.3"),
        appliance("002", "10.1.3"),
        appliance("003", "10.1.3"),
    ]);
    let mut config = config("10.2.0");
    config.concurrency = 1;
    let job = job(config, &["001", "002", "003"]);
    let handle = CancelHandle::new();
    let observer = Arc::new(CancelAt {
        handle: handle.clone(),
        device: "fw-001",
        state: UpgradeState::Done,
    });

    let report = run_with(&fleet, &job, observer, handle.signal()).await;

    assert_eq!(report.results[0].outcome, Outcome::Upgraded);
    for result in &report.results[1..] {
        assert_eq!(result.outcome, Outcome::Cancelled);
        assert!(result.reason.contains("before the device was dispatched"));
        assert_eq!(fleet.calls(&result.serial).connect, 0);
    }
    assert_eq!(fleet.version_of("002").as_deref(), Some("10.1.3"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_install_attempts() {
    let fleet = fleet([SimulatedDevice {
        install_busy: 5,
        ..appliance("001", "10.1.3")
    }]);
    let job = job(config("10.2.0"), &["001"]);
    let handle = CancelHandle::new();
    let observer = Arc::new(CancelOnBusyInstall(handle.clone()));

    let report = run_with(&fleet, &job, observer, handle.signal()).await;

    let result = &report.results[0];
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert_eq!(result.failed_in, Some(UpgradeState::Installing));
    assert!(result.reason.contains("cancelled"));
    let calls = fleet.calls("001");
    assert_eq!(calls.install, 1);
    assert_eq!(calls.reboot, 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected_before_device_work() {
    let fleet = fleet([appliance("001", "10.1.3")]);
    let mut config = config("10.2.0");
    config.concurrency = 0;
    let job = UpgradeJob {
        id: uuid::Uuid::new_v4(),
        config: Arc::new(config),
        targets: vec![target("001")],
    };

    let err = tokio_test::assert_err!(
        BatchScheduler::new(fleet.clone(), fleet.clone())
            .run_job(&job)
            .await
    );

    assert!(matches!(err, UpgradeError::ConfigError(_)));
    assert_eq!(fleet.calls("001").connect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_targets_rejected_before_device_work() {
    let fleet = fleet([
        fwfleet::device::simulated::SimulatedDevice {
            ha: Some(fwfleet::device::simulated::SimulatedHa {
                mode: fleet_models::HaMode::Active,
                peer: "002".to_string(),
            }),
            ..appliance("001", "10.1.3")
        },
        appliance("002", "10.1.3"),
    ]);
    let job = UpgradeJob {
        id: uuid::Uuid::new_v4(),
        config: Arc::new(config("10.2.0")),
        targets: vec![target("001"), target("001"), target("002")],
    };

    let err = tokio_test::assert_err!(
        BatchScheduler::new(fleet.clone(), fleet.clone())
            .run_job(&job)
            .await
    );

    assert!(matches!(err, UpgradeError::ValidationError(_)));
    assert_eq!(fleet.calls("001").connect, 0);
    assert_eq!(fleet.calls("002").connect, 0);
}

#[tokio::test]
async fn test_empty_target_serial_rejected() {
    let fleet = fleet([appliance("001", "10.1.3")]);
    let mut blank = target("001");
    blank.serial = " ".to_string();
    let job = UpgradeJob {
        id: uuid::Uuid::new_v4(),
        config: Arc::new(config("10.2.0")),
        targets: vec![blank],
    };

    let err = BatchScheduler::new(fleet.clone(), fleet.clone())
        .run_job(&job)
        .await
        .unwrap_err();

    assert!(matches!(err, UpgradeError::ValidationError(_)));
}

#[test]
fn test_duplicate_serials_rejected() {
    let err = UpgradeJob::new(config("10.2.0"), vec![target("001"), target("001")]).unwrap_err();
    assert!(matches!(err, UpgradeError::ValidationError(_)));
}

#[tokio::test(start_paused = true)]
async fn test_report_serializes_to_json() {
    let fleet = fleet([appliance("001", "10.1.3")]);
    let job = job(config("10.2.0"), &["001"]);

    let report = run(&fleet, &job).await;
    let value = serde_json::to_value(&report).unwrap();

    let result = &value["results"][0];
    assert_eq!(result["serial"], "001");
    assert_eq!(result["outcome"], "upgraded");
    assert_eq!(result["pass"], "first");
    assert_eq!(result["starting_version"], "10.1.3");
    assert!(result["reboot_elapsed"].as_f64().unwrap() > 0.0);
    assert_eq!(value["job_id"], job.id.to_string());
}

#[tokio::test(start_paused = true)]
async fn test_free_run_job_uses_defaults() {
    let fleet = fleet([appliance("001", "10.2.0")]);
    let job = job(config("10.2.0"), &["001"]);

    let report = tokio_test::assert_ok!(fwfleet::run_job(&job, fleet.clone(), fleet.clone()).await);

    assert_eq!(report.results[0].outcome, Outcome::NoUpgradeNeeded);
}
