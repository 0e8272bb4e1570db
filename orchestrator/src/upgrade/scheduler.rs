//! Batch scheduler
//!
//! Runs every device of a job under a bounded worker pool in two passes: the
//! ready set first, then the HA members deferred to the revisit set. Exactly
//! one result is produced per submitted device, in submission order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::device::client::{AssuranceProvider, DeviceClient};
use crate::errors::UpgradeError;
use crate::models::device::{Device, DeviceTarget};
use crate::models::job::UpgradeJob;
use crate::models::result::{DeviceResult, JobReport, Outcome, Pass};
use crate::upgrade::cancel::CancelSignal;
use crate::upgrade::fsm::UpgradeState;
use crate::upgrade::ha::{self, Deferral, PairingTable, UnitReport};
use crate::upgrade::machine::DeviceUpgrader;
use crate::upgrade::progress::{LogProgress, ProgressObserver};

/// Runs upgrade jobs against a device client and assurance provider
pub struct BatchScheduler {
    client: Arc<dyn DeviceClient>,
    assurance: Arc<dyn AssuranceProvider>,
    progress: Arc<dyn ProgressObserver>,
    cancel: CancelSignal,
}

impl BatchScheduler {
    /// Create a scheduler logging progress through `tracing`
    pub fn new(client: Arc<dyn DeviceClient>, assurance: Arc<dyn AssuranceProvider>) -> Self {
        Self {
            client,
            assurance,
            progress: Arc::new(LogProgress),
            cancel: CancelSignal::never(),
        }
    }

    /// Report progress to `progress` instead
    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Observe `cancel` for job cancellation
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run both passes of `job` and collect one result per device
    ///
    /// Only configuration or device-list problems found before any device
    /// work are returned as errors; device failures are recorded on their results.
    pub async fn run_job(&self, job: &UpgradeJob) -> Result<JobReport, UpgradeError> {
        job.validate()?;
        let started_at = Utc::now();
        let upgrader = DeviceUpgrader::new(
            Arc::clone(&job.config),
            Arc::clone(&self.client),
            Arc::clone(&self.assurance),
            Arc::clone(&self.progress),
            self.cancel.clone(),
        );
        let semaphore = Arc::new(Semaphore::new(job.config.concurrency));

        info!(
            "Job {}: upgrading {} device(s) to {} (concurrency {}{})",
            job.id,
            job.targets.len(),
            job.config.target_version,
            job.config.concurrency,
            if job.config.dry_run { ", dry run" } else { "" }
        );

        let mut slots: Vec<Option<DeviceResult>> = vec![None; job.targets.len()];
        let (pairing, deferred) = self
            .first_pass(job, &upgrader, &semaphore, &mut slots)
            .await?;

        if !deferred.is_empty() {
            self.revisit_pass(&upgrader, &semaphore, deferred, &pairing, &mut slots)
                .await?;
        }

        let results: Vec<DeviceResult> = slots
            .into_iter()
            .zip(&job.targets)
            .map(|(slot, target)| slot.unwrap_or_else(|| missing_result(target, job)))
            .collect();

        let report = JobReport {
            job_id: job.id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        let counts = report.counts();
        info!(
            "Job {} finished: {} upgraded, {} already current, {} dry run, {} failed, {} cancelled",
            job.id,
            counts.upgraded,
            counts.no_upgrade_needed,
            counts.dry_run,
            counts.failed,
            counts.cancelled
        );
        Ok(report)
    }

    /// Pass 1: every device, with HA active members possibly deferred
    async fn first_pass(
        &self,
        job: &UpgradeJob,
        upgrader: &DeviceUpgrader,
        semaphore: &Arc<Semaphore>,
        slots: &mut [Option<DeviceResult>],
    ) -> Result<(PairingTable, Vec<(usize, Deferral)>), UpgradeError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(job.targets.len());

        for (index, target) in job.targets.iter().enumerate() {
            let mut device = Device::dispatch(target, &job.config);
            let permit = Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map_err(|e| UpgradeError::Internal(format!("worker pool closed: {e}")))?;

            if self.cancel.is_cancelled() {
                slots[index] = Some(skip(&mut device, Pass::First));
                continue;
            }

            debug!("Dispatching {} ({})", device.name, device.serial);
            let fallback = device.clone();
            let upgrader = upgrader.clone();
            let tx = tx.clone();
            handles.push((
                index,
                fallback,
                tokio::spawn(async move {
                    let _permit = permit;
                    ha::first_pass(&upgrader, device, &tx).await
                }),
            ));
        }
        drop(tx);

        let joined = join_all(
            handles
                .into_iter()
                .map(|(index, fallback, handle)| async move { (index, fallback, handle.await) }),
        )
        .await;

        let mut pairing = PairingTable::default();
        let mut deferred_at: HashMap<String, usize> = HashMap::new();
        for (index, fallback, joined) in joined {
            match joined {
                Ok(UnitReport::Finished(result)) => {
                    if let Some(peer) = &result.peer_serial {
                        pairing.record(&result.serial, peer);
                    }
                    slots[index] = Some(result);
                }
                Ok(UnitReport::Deferred { serial, peer }) => {
                    if let Some(peer) = peer {
                        pairing.record(&serial, peer);
                    }
                    deferred_at.insert(serial, index);
                }
                Err(e) => {
                    error!("Worker for {} died: {}", fallback.name, e);
                    slots[index] = Some(crashed(fallback, Pass::First, &e.to_string()));
                }
            }
        }

        // Every sender is gone once pass 1 has drained
        let mut seen = HashSet::new();
        let mut deferred = Vec::new();
        while let Some(deferral) = rx.recv().await {
            let serial = deferral.device.serial.clone();
            if !seen.insert(serial.clone()) {
                warn!("Ignoring duplicate deferral for {}", serial);
                continue;
            }
            match deferred_at.get(&serial) {
                Some(&index) => deferred.push((index, deferral)),
                None => warn!("Deferral for {} has no pass-1 slot", serial),
            }
        }
        deferred.sort_by_key(|(index, _)| *index);

        info!(
            "Pass 1 complete: {} finished, {} deferred to revisit, {} HA member(s) paired",
            slots.iter().filter(|slot| slot.is_some()).count(),
            deferred.len(),
            pairing.len()
        );
        Ok((pairing, deferred))
    }

    /// Pass 2: deferred HA members, after their peers have finished
    async fn revisit_pass(
        &self,
        upgrader: &DeviceUpgrader,
        semaphore: &Arc<Semaphore>,
        deferred: Vec<(usize, Deferral)>,
        pairing: &PairingTable,
        slots: &mut [Option<DeviceResult>],
    ) -> Result<(), UpgradeError> {
        info!("Pass 2: revisiting {} deferred device(s)", deferred.len());
        if pairing.is_empty() {
            warn!("Deferred devices reported no HA peers; peer outcomes will not be annotated");
        }
        let mut handles = Vec::with_capacity(deferred.len());

        for (index, mut deferral) in deferred {
            let permit = Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map_err(|e| UpgradeError::Internal(format!("worker pool closed: {e}")))?;

            if self.cancel.is_cancelled() {
                slots[index] = Some(skip(&mut deferral.device, Pass::Revisit));
                continue;
            }

            let fallback = deferral.device.clone();
            let upgrader = upgrader.clone();
            handles.push((
                index,
                fallback,
                tokio::spawn(async move {
                    let _permit = permit;
                    ha::revisit(&upgrader, deferral).await
                }),
            ));
        }

        let finished = join_all(handles.into_iter().map(|(index, fallback, handle)| async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker for {} died: {}", fallback.name, e);
                    crashed(fallback, Pass::Revisit, &e.to_string())
                }
            };
            (index, result)
        }))
        .await;

        let outcome_of = |slots: &[Option<DeviceResult>], serial: &str| {
            slots
                .iter()
                .flatten()
                .find(|result| result.serial == serial && result.pass == Pass::First)
                .map(|result| result.outcome)
        };
        for (index, mut result) in finished {
            pairing.annotate(&mut result, |peer| outcome_of(slots, peer));
            slots[index] = Some(result);
        }
        Ok(())
    }
}

/// Result for a device never dispatched because the job was cancelled
fn skip(device: &mut Device, pass: Pass) -> DeviceResult {
    if let Err(e) = device.advance(UpgradeState::Cancelled) {
        warn!("{}: {}", device.name, e);
    }
    info!("{}: not dispatched, job cancelled", device.name);
    DeviceResult::cancelled_before_dispatch(device, pass)
}

fn crashed(device: Device, pass: Pass, cause: &str) -> DeviceResult {
    DeviceResult::start(&device, pass).finish(
        &device,
        Outcome::Failed,
        format!("device worker failed: {cause}"),
    )
}

fn missing_result(target: &DeviceTarget, job: &UpgradeJob) -> DeviceResult {
    error!("No result recorded for {}", target.name);
    let device = Device::dispatch(target, &job.config);
    DeviceResult::start(&device, Pass::First).finish(
        &device,
        Outcome::Failed,
        "no result recorded for the device",
    )
}

/// Run `job` with the default log-based progress observer and no cancellation
pub async fn run_job(
    job: &UpgradeJob,
    client: Arc<dyn DeviceClient>,
    assurance: Arc<dyn AssuranceProvider>,
) -> Result<JobReport, UpgradeError> {
    BatchScheduler::new(client, assurance).run_job(job).await
}
