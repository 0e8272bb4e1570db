//! Error types for fwfleet

use thiserror::Error;

/// Main error type for the orchestrator
///
/// Device-scoped failures are never reported through this type; they are
/// recorded on the device's result. These errors abort a job before any
/// device work begins, or stop the binary itself.
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for UpgradeError {
    fn from(err: anyhow::Error) -> Self {
        UpgradeError::Internal(err.to_string())
    }
}
