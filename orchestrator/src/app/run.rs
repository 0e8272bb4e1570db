//! Main application run

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::app::console::{print_summary, ConsoleProgress};
use crate::app::options::RunOptions;
use crate::errors::UpgradeError;
use crate::filesys::file::File;
use crate::models::job::UpgradeJob;
use crate::models::result::JobReport;
use crate::storage::inventory::Inventory;
use crate::storage::settings::{password_from_env, Settings};
use crate::upgrade::cancel::CancelHandle;
use crate::upgrade::scheduler::BatchScheduler;

/// Load the inventory, run one job and report it
///
/// `shutdown_signal` resolving cancels the job: devices not yet dispatched
/// are skipped and running ones stop at their next safe boundary.
pub async fn run(
    options: &RunOptions,
    settings: &Settings,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JobReport, UpgradeError> {
    let inventory: Inventory = File::new(&options.inventory_path).read_json().await?;
    inventory.validate()?;
    if !inventory.is_rehearsal() {
        return Err(UpgradeError::ConfigError(
            "no appliance API client is linked into this build; \
             add simulations to the inventory for a rehearsal run"
                .to_string(),
        ));
    }

    // Simulated appliances accept any credentials
    let password = password_from_env().unwrap_or_default();
    let mut config = settings.to_job_config(password)?;
    if options.dry_run {
        config.dry_run = true;
    }
    let job = UpgradeJob::new(config, inventory.devices.clone())?;

    info!("Rehearsal run against {} simulated device(s)", inventory.simulations.len());
    let fleet = Arc::new(inventory.fleet());

    let cancel = CancelHandle::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal.await;
            warn!("Cancelling job; running devices stop at their next safe point");
            cancel.cancel();
        }
    });

    let scheduler = BatchScheduler::new(fleet.clone(), fleet)
        .with_progress(Arc::new(ConsoleProgress))
        .with_cancel(cancel.signal());
    let result = scheduler.run_job(&job).await;
    watcher.abort();
    let report = result?;

    print_summary(&report);

    if let Some(path) = &options.output {
        let file = File::new(path);
        match file.write_json(&report).await {
            Ok(()) => info!("Job report written to {}", path.display()),
            Err(e) => {
                error!("Failed to write job report to {}: {}", path.display(), e);
                return Err(e);
            }
        }
    }

    Ok(report)
}
