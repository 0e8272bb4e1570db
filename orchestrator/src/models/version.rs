//! Firmware version parsing and comparison
//!
//! Appliance firmware is versioned as `major.minor.maintenance` with an
//! optional hotfix suffix (`10.2.0-h2`). Versions are compared as tuples, a
//! release without a hotfix sorting before any of its hotfixes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::UpgradeError;

/// Structured firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SoftwareVersion {
    pub major: u32,
    pub minor: u32,
    pub maintenance: u32,
    /// Hotfix number, 0 for a plain release
    pub hotfix: u32,
}

impl SoftwareVersion {
    /// Create a version from its parts
    pub const fn new(major: u32, minor: u32, maintenance: u32, hotfix: u32) -> Self {
        Self {
            major,
            minor,
            maintenance,
            hotfix,
        }
    }

    /// The base image of this release line (`10.2.3-h1` -> `10.2.0`)
    pub fn base_image(&self) -> Self {
        Self::new(self.major, self.minor, 0, 0)
    }

    /// Whether this version is its own base image
    pub fn is_base_image(&self) -> bool {
        *self == self.base_image()
    }
}

impl FromStr for SoftwareVersion {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UpgradeError::InvalidVersion(s.to_string());
        let trimmed = s.trim();

        let (release, hotfix) = match trimmed.split_once('-') {
            Some((release, suffix)) => {
                let digits = suffix.strip_prefix('h').ok_or_else(invalid)?;
                (release, digits.parse::<u32>().map_err(|_| invalid())?)
            }
            None => (trimmed, 0),
        };

        let parts: Vec<&str> = release.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2], hotfix))
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.maintenance)?;
        if self.hotfix > 0 {
            write!(f, "-h{}", self.hotfix)?;
        }
        Ok(())
    }
}

impl Serialize for SoftwareVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SoftwareVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
