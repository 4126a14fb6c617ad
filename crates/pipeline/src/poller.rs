//! Polling a submitted job until it reaches a terminal state.
//!
//! The loop runs on an injected [`Clock`], so tests drive it with virtual
//! time. The overall timeout is measured from the submission reading passed
//! in by the caller, and the number of poll calls never exceeds
//! `timeout / interval` (at least one).

use std::time::Duration;

use avagen_comfyui::api::AdapterError;
use avagen_comfyui::backend::RenderBackend;
use avagen_comfyui::protocol::{ArtifactRef, PollResult, ProgressInfo, SubmissionHandle};
use avagen_core::clock::Clock;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Polling cadence and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Overall budget, measured from submission.
    pub timeout: Duration,
    /// Consecutive transient errors tolerated before giving up.
    pub max_transient_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
            max_transient_errors: 3,
        }
    }
}

impl PollConfig {
    fn max_polls(&self) -> u128 {
        let interval = self.interval.as_millis().max(1);
        (self.timeout.as_millis() / interval).max(1)
    }
}

/// Poll `handle` until the server reports completion or failure.
///
/// `submitted_at` is a reading of `clock` taken when the job was submitted.
/// `on_progress` is called for every `Running` report.
pub async fn wait_for_completion<F>(
    backend: &dyn RenderBackend,
    handle: &SubmissionHandle,
    config: &PollConfig,
    clock: &dyn Clock,
    submitted_at: Duration,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<Vec<ArtifactRef>, PipelineError>
where
    F: FnMut(&ProgressInfo),
{
    let max_polls = config.max_polls();
    let mut polls: u128 = 0;
    let mut transient_errors = 0u32;

    loop {
        polls += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = backend.poll(handle) => result,
        };

        match result {
            Ok(PollResult::Completed(artifacts)) => {
                tracing::info!(
                    prompt_id = %handle.id,
                    polls = polls as u64,
                    artifacts = artifacts.len(),
                    "Rendering finished",
                );
                return Ok(artifacts);
            }
            Ok(PollResult::Failed(reason)) => {
                tracing::warn!(prompt_id = %handle.id, %reason, "Job failed on the rendering server");
                return Err(PipelineError::Render(reason));
            }
            Ok(PollResult::Running(info)) => {
                transient_errors = 0;
                tracing::debug!(prompt_id = %handle.id, status = %info.status, "Job running");
                on_progress(&info);
            }
            Ok(PollResult::Pending) => {
                transient_errors = 0;
                tracing::debug!(prompt_id = %handle.id, "Job pending");
            }
            Err(e) if e.is_transient() && transient_errors < config.max_transient_errors => {
                transient_errors += 1;
                tracing::warn!(
                    prompt_id = %handle.id,
                    error = %e,
                    "Poll attempt failed ({transient_errors}/{}), retrying",
                    config.max_transient_errors,
                );
            }
            Err(e) => return Err(e.into()),
        }

        let elapsed = clock.since(submitted_at);
        if polls >= max_polls || elapsed + config.interval > config.timeout {
            let remaining = config.timeout.saturating_sub(elapsed);
            sleep_or_cancel(clock, remaining, cancel).await?;
            let elapsed = clock.since(submitted_at);
            tracing::warn!(
                prompt_id = %handle.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Timed out waiting for job completion",
            );
            return Err(AdapterError::PollTimeout { elapsed }.into());
        }

        sleep_or_cancel(clock, config.interval, cancel).await?;
    }
}

async fn sleep_or_cancel(
    clock: &dyn Clock,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        _ = clock.sleep(duration) => Ok(()),
    }
}
