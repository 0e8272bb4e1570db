//! Contracts for the external device API client and assurance provider

use async_trait::async_trait;
use fleet_models::{ConfigBackup, DeviceFacts, DiffReport, ImageStatus, ReadinessReport, Snapshot};

use crate::models::device::Endpoint;
use crate::models::job::{Credentials, Timeouts};
use crate::models::version::SoftwareVersion;
use crate::upgrade::retry::PhaseOutcome;

/// Authenticated session handle issued by a [`DeviceClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub serial: String,

    /// Client-defined opaque handle
    pub handle: String,
}

/// Device API client
///
/// Implementations classify their own failures: transient conditions such as
/// a busy image manager or a dropped connection are
/// [`PhaseOutcome::Retryable`]; authentication, validation and unsupported
/// operations are [`PhaseOutcome::Fatal`].
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeouts: &Timeouts,
    ) -> PhaseOutcome<Session>;

    /// Running version and HA state
    async fn facts(&self, session: &Session) -> PhaseOutcome<DeviceFacts>;

    /// Software images the device offers, with their download state
    async fn available_images(&self, session: &Session) -> PhaseOutcome<Vec<ImageStatus>>;

    async fn download_image(&self, session: &Session, version: &SoftwareVersion) -> PhaseOutcome<()>;

    async fn export_config(&self, session: &Session) -> PhaseOutcome<ConfigBackup>;

    async fn install_image(&self, session: &Session, version: &SoftwareVersion) -> PhaseOutcome<()>;

    async fn reboot(&self, session: &Session) -> PhaseOutcome<()>;

    /// Suspend the local HA member so its peer takes over
    async fn suspend_ha(&self, session: &Session) -> PhaseOutcome<()>;
}

/// Readiness checks, snapshots and snapshot diffs
#[async_trait]
pub trait AssuranceProvider: Send + Sync {
    async fn snapshot(&self, session: &Session, categories: &[String]) -> PhaseOutcome<Snapshot>;

    async fn run_checks(&self, session: &Session, checks: &[String]) -> ReadinessReport;

    async fn diff(&self, pre: &Snapshot, post: &Snapshot) -> DiffReport;
}
