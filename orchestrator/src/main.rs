//! fwfleet - Entry Point
//!
//! Upgrades a fleet of network appliances, standalone or HA-paired, to a
//! target firmware version.

use std::env;
use std::process::ExitCode;

use fwfleet::app::options::{parse_args, RunOptions};
use fwfleet::app::run::run;
use fwfleet::filesys::file::File;
use fwfleet::logs::{init_logging, LogOptions};
use fwfleet::storage::settings::Settings;
use fwfleet::utils::version_info;

use anyhow::Context;
use tracing::{error, info};

/// Exit status when the job could not run at all
const EXIT_SETUP_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli_args = parse_args(env::args().skip(1));

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let options = match RunOptions::from_cli(&cli_args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    };

    let settings = match load_settings(&options).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: options.log_level.unwrap_or(settings.log_level),
        json_format: settings.log_json,
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    info!(
        "fwfleet {} ({}) starting with {}",
        version.version,
        version.git_hash,
        options.inventory_path.display()
    );
    match run(&options, &settings, await_shutdown_signal()).await {
        Ok(report) => ExitCode::from(report.exit_code() as u8),
        Err(e) => {
            error!("Upgrade job failed: {e}");
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

async fn load_settings(options: &RunOptions) -> anyhow::Result<Settings> {
    File::new(&options.settings_path)
        .read_json::<Settings>()
        .await
        .with_context(|| {
            format!(
                "unable to read settings file {}",
                options.settings_path.display()
            )
        })
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                await_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, cancelling...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    await_ctrl_c().await;
}

async fn await_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, cancelling..."),
        // Without a handler the job simply runs to completion
        Err(_) => std::future::pending::<()>().await,
    }
}
