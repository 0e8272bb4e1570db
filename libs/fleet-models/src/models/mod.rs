//! Appliance API models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// High-availability state reported by an appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaMode {
    /// Not part of an HA pair
    None,
    /// Member currently passing traffic
    Active,
    /// Standby member
    Passive,
    /// Pair member that is transitioning or misconfigured
    NonFunctional,
    /// State string not recognized
    Unknown,
}

impl HaMode {
    /// Parse the state string an appliance reports
    pub fn from_reported(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "" | "none" | "disabled" | "standalone" => HaMode::None,
            "active" | "active-primary" | "active-secondary" => HaMode::Active,
            "passive" => HaMode::Passive,
            "non-functional" | "suspended" | "initial" | "tentative" => HaMode::NonFunctional,
            _ => HaMode::Unknown,
        }
    }

    /// Whether the appliance belongs to an HA pair
    pub fn is_paired(&self) -> bool {
        !matches!(self, HaMode::None)
    }
}

impl std::fmt::Display for HaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HaMode::None => "none",
            HaMode::Active => "active",
            HaMode::Passive => "passive",
            HaMode::NonFunctional => "non-functional",
            HaMode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What an appliance reports about its HA peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub serial: String,
    pub version: String,
    pub mode: HaMode,
}

/// HA section of the device facts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaInfo {
    pub mode: HaMode,
    /// Peer details, when the peer is reachable
    pub peer: Option<PeerInfo>,

    /// Running configuration is synchronized with the peer
    #[serde(default)]
    pub config_synced: bool,
}

/// Version and HA state as reported by an appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFacts {
    pub hostname: String,
    pub serial: String,
    pub version: String,
    pub ha: Option<HaInfo>,
}

impl DeviceFacts {
    /// HA mode, `None` for a standalone appliance
    pub fn ha_mode(&self) -> HaMode {
        self.ha.as_ref().map(|ha| ha.mode).unwrap_or(HaMode::None)
    }

    /// Get the HA peer, if reported
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.ha.as_ref().and_then(|ha| ha.peer.as_ref())
    }
}

/// One entry of an appliance's software image listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {
    pub version: String,
    /// Image is staged on the device
    pub downloaded: bool,
}

/// Readiness check result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Skip,
    Fail,
}

/// Per-check readiness results keyed by check name
pub type ReadinessReport = BTreeMap<String, CheckStatus>;

/// Point-in-time network state capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    /// Categories captured
    pub categories: Vec<String>,

    /// Category name to captured content
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

/// Differences between a pre- and post-upgrade snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Category name to a human-readable list of changes
    #[serde(default)]
    pub changes: BTreeMap<String, Vec<String>>,
}

impl DiffReport {
    /// Whether no category changed
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(|c| c.is_empty())
    }
}

/// Exported running configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBackup {
    pub captured_at: DateTime<Utc>,
    /// Exported configuration text
    pub content: String,
}
