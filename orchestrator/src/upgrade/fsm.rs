//! Finite state machine for a single device upgrade

use serde::{Deserialize, Serialize};

/// Orchestration state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    Init,
    Connected,
    VersionChecked,

    /// Already at or beyond the target version
    NoUpgradeNeeded,

    UpgradeRequired,

    /// HA active member held back for the revisit pass
    Deferred,

    Downloading,
    Downloaded,
    PreSnapshot,
    ReadinessChecked,
    BackedUp,

    /// Dry run stops here, after the backup
    DryRunHalt,

    Installing,
    Installed,
    Rebooting,
    RebootVerified,
    PostSnapshot,
    Done,
    Failed,
    Cancelled,
}

impl UpgradeState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeState::NoUpgradeNeeded
                | UpgradeState::DryRunHalt
                | UpgradeState::Done
                | UpgradeState::Failed
                | UpgradeState::Cancelled
        )
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde names so logs and reports agree
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&name)
    }
}

/// Upgrade FSM
#[derive(Debug, Clone)]
pub struct UpgradeFsm {
    state: UpgradeState,
    history: Vec<UpgradeState>,
}

impl UpgradeFsm {
    /// Create a new FSM in the init state
    pub fn new() -> Self {
        Self {
            state: UpgradeState::Init,
            history: vec![UpgradeState::Init],
        }
    }

    /// Get current state
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[UpgradeState] {
        &self.history
    }

    /// Whether `next` is reachable from `from` in one step
    pub fn can_transition(from: UpgradeState, next: UpgradeState) -> bool {
        use UpgradeState::*;

        match (from, next) {
            // Failure and cancellation are reachable from any live state
            (from, Failed | Cancelled) => !from.is_terminal(),

            (Init, Connected)
            | (Connected, VersionChecked)
            | (VersionChecked, NoUpgradeNeeded | UpgradeRequired | Deferred)
            | (Deferred, Init)
            | (UpgradeRequired, Downloading)
            | (Downloading, Downloaded)
            | (Downloaded, PreSnapshot)
            | (PreSnapshot, ReadinessChecked)
            | (ReadinessChecked, BackedUp)
            | (BackedUp, DryRunHalt | Installing)
            | (Installing, Installed)
            | (Installed, Rebooting)
            | (Rebooting, RebootVerified)
            | (RebootVerified, PostSnapshot)
            | (PostSnapshot, Done) => true,

            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the machine does not define
    pub fn advance(&mut self, next: UpgradeState) -> Result<(), String> {
        if !Self::can_transition(self.state, next) {
            return Err(format!(
                "Invalid transition: {:?} -> {:?}",
                self.state, next
            ));
        }

        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for UpgradeFsm {
    fn default() -> Self {
        Self::new()
    }
}
