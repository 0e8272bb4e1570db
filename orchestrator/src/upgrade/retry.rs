//! Bounded retry with a fixed delay between attempts
//!
//! Every unreliable device or assurance call is wrapped here. The operation
//! reports a [`PhaseOutcome`]; only [`PhaseOutcome::Retryable`] is retried.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::job::RetryPolicy;
use crate::upgrade::cancel::CancelSignal;

/// Tri-state result of one phase attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome<T> {
    Success(T),

    /// Transient condition; worth another attempt
    Retryable(String),

    /// Aborts the phase regardless of remaining attempts
    Fatal(String),
}

/// Outcome kind without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Retryable,
    Fatal,
}

impl<T> PhaseOutcome<T> {
    /// Kind of this outcome, for observers
    pub fn status(&self) -> OutcomeStatus {
        match self {
            PhaseOutcome::Success(_) => OutcomeStatus::Success,
            PhaseOutcome::Retryable(_) => OutcomeStatus::Retryable,
            PhaseOutcome::Fatal(_) => OutcomeStatus::Fatal,
        }
    }

    /// Whether the attempt succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Success(_))
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            PhaseOutcome::Success(_) => None,
            PhaseOutcome::Retryable(reason) | PhaseOutcome::Fatal(reason) => Some(reason),
        }
    }

    /// Map the success value, keeping failures as they are
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PhaseOutcome<U> {
        match self {
            PhaseOutcome::Success(value) => PhaseOutcome::Success(f(value)),
            PhaseOutcome::Retryable(reason) => PhaseOutcome::Retryable(reason),
            PhaseOutcome::Fatal(reason) => PhaseOutcome::Fatal(reason),
        }
    }
}

/// What the retry loop ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport<T> {
    /// Last outcome observed
    pub outcome: PhaseOutcome<T>,

    /// Attempts actually made
    pub attempts: u32,

    /// Stopped early at a retry boundary because the job was cancelled
    pub cancelled: bool,
}

/// Run `operation` up to `policy.max_tries` times.
///
/// Sleeps `policy.interval` between attempts and stops early on success or a
/// fatal failure. When `cancel` is given, cancellation is observed at each
/// retry boundary and ends the loop with a fatal outcome and
/// `cancelled = true`; the attempt in flight is never interrupted.
///
/// `observer` receives `(attempt, max_tries, outcome)` after every attempt.
pub async fn retry<T, F, Fut, O>(
    policy: &RetryPolicy,
    cancel: Option<&CancelSignal>,
    mut observer: O,
    mut operation: F,
) -> RetryReport<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PhaseOutcome<T>>,
    O: FnMut(u32, u32, &PhaseOutcome<T>),
{
    let max_tries = policy.max_tries;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = operation(attempt).await;
        observer(attempt, max_tries, &outcome);

        match outcome {
            PhaseOutcome::Retryable(reason) if attempt < max_tries => {
                debug!(
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    attempt, max_tries, policy.interval, reason
                );
            }
            outcome => {
                return RetryReport {
                    outcome,
                    attempts: attempt,
                    cancelled: false,
                }
            }
        }

        match cancel {
            Some(cancel) => {
                if cancel.is_cancelled() {
                    return cancelled_report(attempt);
                }
                tokio::select! {
                    _ = tokio::time::sleep(policy.interval) => {}
                    _ = cancel.cancelled() => return cancelled_report(attempt),
                }
            }
            None => {
                if !policy.interval.is_zero() {
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }
}

fn cancelled_report<T>(attempts: u32) -> RetryReport<T> {
    RetryReport {
        outcome: PhaseOutcome::Fatal("job cancelled".to_string()),
        attempts,
        cancelled: true,
    }
}
