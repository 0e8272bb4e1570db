//! Console output for the binary

use colored::Colorize;

use crate::models::result::{DeviceResult, JobReport, Outcome};
use crate::upgrade::fsm::UpgradeState;
use crate::upgrade::progress::{AttemptEvent, ProgressObserver};
use crate::upgrade::retry::OutcomeStatus;

/// Prints state changes and failed attempts as they happen
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgress;

impl ProgressObserver for ConsoleProgress {
    fn on_attempt(&self, event: &AttemptEvent<'_>) {
        if event.status == OutcomeStatus::Success {
            return;
        }
        println!(
            "  {} {} {} attempt {}/{}: {}",
            "↻".yellow(),
            event.device.bold(),
            event.phase,
            event.attempt,
            event.max_tries,
            event.reason.unwrap_or("no reason given").dimmed()
        );
    }

    fn on_state(&self, device: &str, state: UpgradeState) {
        let label = state.to_string();
        let label = match state {
            UpgradeState::Done | UpgradeState::NoUpgradeNeeded | UpgradeState::DryRunHalt => {
                label.green()
            }
            UpgradeState::Failed | UpgradeState::Cancelled => label.red(),
            UpgradeState::Deferred => label.yellow(),
            _ => label.normal(),
        };
        println!("  {} {}", device.bold(), label);
    }
}

fn outcome_icon(result: &DeviceResult) -> colored::ColoredString {
    match result.outcome {
        Outcome::Failed => "✗".red(),
        Outcome::Cancelled => "■".red(),
        _ if !result.warnings.is_empty() => "⚠".yellow(),
        _ => "✓".green(),
    }
}

/// Print the per-device table and totals
pub fn print_summary(report: &JobReport) {
    println!();
    println!("{}", format!("Upgrade job {}", report.job_id).bold());
    println!("{}", "-".repeat(60));

    for result in &report.results {
        let from = result
            .starting_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {} {} ({}) {} -> {}: {}",
            outcome_icon(result),
            result.name.bold(),
            result.serial,
            from,
            result.target_version,
            result.reason
        );
        if let Some(state) = result.failed_in {
            println!("      failed in {}", state.to_string().red());
        }
        for warning in &result.warnings {
            println!("      {} {}", "⚠".yellow(), warning.message.dimmed());
        }
    }

    let counts = report.counts();
    println!();
    println!("Summary:");
    println!("  {} Upgraded: {}", "✓".green(), counts.upgraded);
    println!("  {} Already current: {}", "✓".green(), counts.no_upgrade_needed);
    if counts.dry_run > 0 {
        println!("  {} Dry run: {}", "ℹ".blue(), counts.dry_run);
    }
    if counts.with_warnings > 0 {
        println!(
            "  {} With warnings: {}",
            "⚠".yellow(),
            counts.with_warnings.to_string().yellow()
        );
    }
    if counts.failed > 0 {
        println!("  {} Failed: {}", "✗".red(), counts.failed.to_string().red());
    }
    if counts.cancelled > 0 {
        println!("  {} Cancelled: {}", "■".red(), counts.cancelled.to_string().red());
    }
}
