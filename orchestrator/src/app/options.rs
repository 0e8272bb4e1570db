//! Command line options

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::UpgradeError;
use crate::logs::LogLevel;

/// Options for one run of the binary
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Settings file, `--settings`
    pub settings_path: PathBuf,
    /// Inventory file, `--inventory`
    pub inventory_path: PathBuf,

    /// Write the JSON job report here
    pub output: Option<PathBuf>,

    /// Force a dry run regardless of the settings file
    pub dry_run: bool,

    /// Overrides the settings file's log level
    pub log_level: Option<LogLevel>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("settings.json"),
            inventory_path: PathBuf::from("inventory.json"),
            output: None,
            dry_run: false,
            log_level: None,
        }
    }
}

impl RunOptions {
    /// Build from `--key=value` arguments, flags mapped to `"true"`
    pub fn from_cli(args: &HashMap<String, String>) -> Result<Self, UpgradeError> {
        let mut options = Self::default();

        if let Some(path) = args.get("settings") {
            options.settings_path = PathBuf::from(path);
        }
        if let Some(path) = args.get("inventory") {
            options.inventory_path = PathBuf::from(path);
        }
        options.output = args.get("output").map(PathBuf::from);
        options.dry_run = match args.get("dry-run").map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(UpgradeError::ConfigError(format!(
                    "--dry-run takes no value, got {other:?}"
                )))
            }
        };
        options.log_level = args
            .get("log-level")
            .map(|level| level.parse::<LogLevel>())
            .transpose()
            .map_err(UpgradeError::ConfigError)?;

        Ok(options)
    }
}

/// Split `--key=value` and `--flag` arguments
pub fn parse_args(args: impl IntoIterator<Item = String>) -> HashMap<String, String> {
    let mut cli_args = HashMap::new();
    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }
    cli_args
}
