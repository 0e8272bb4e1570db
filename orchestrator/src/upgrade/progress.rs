//! Progress observers
//!
//! The orchestrator reports per-attempt and per-state events through
//! [`ProgressObserver`] so that presentation layers can render them without
//! the core depending on any output format.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::upgrade::fsm::UpgradeState;
use crate::upgrade::retry::OutcomeStatus;

/// Retried step an attempt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPhase {
    BaseDownload,
    Download,
    Snapshot,
    Install,
    Reboot,
    HaSync,
}

impl std::fmt::Display for RetryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryPhase::BaseDownload => "base image download",
            RetryPhase::Download => "download",
            RetryPhase::Snapshot => "snapshot",
            RetryPhase::Install => "install",
            RetryPhase::Reboot => "reboot verification",
            RetryPhase::HaSync => "HA sync",
        };
        f.write_str(s)
    }
}

/// One finished attempt of a retried phase
#[derive(Debug, Clone, Copy)]
pub struct AttemptEvent<'a> {
    pub device: &'a str,
    pub phase: RetryPhase,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_tries: u32,
    pub status: OutcomeStatus,
    /// Failure reason for a failed attempt
    pub reason: Option<&'a str>,
}

/// Sink for orchestration progress
pub trait ProgressObserver: Send + Sync {
    fn on_attempt(&self, event: &AttemptEvent<'_>);

    fn on_state(&self, device: &str, state: UpgradeState);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {
    fn on_attempt(&self, _event: &AttemptEvent<'_>) {}

    fn on_state(&self, _device: &str, _state: UpgradeState) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_attempt(&self, event: &AttemptEvent<'_>) {
        match event.status {
            OutcomeStatus::Success => debug!(
                "{}: {} succeeded on attempt {}/{}",
                event.device, event.phase, event.attempt, event.max_tries
            ),
            OutcomeStatus::Retryable | OutcomeStatus::Fatal => warn!(
                "{}: {} attempt {}/{} failed ({:?}): {}",
                event.device,
                event.phase,
                event.attempt,
                event.max_tries,
                event.status,
                event.reason.unwrap_or("no reason given")
            ),
        }
    }

    fn on_state(&self, device: &str, state: UpgradeState) {
        info!("{}: {}", device, state);
    }
}
