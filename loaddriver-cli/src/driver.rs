use std::sync::Arc;

use anyhow::Result;
use loaddriver_core::{Collaborators, run_local};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::report::{Recorder, Summary};
use crate::target::SimulatedTarget;
use crate::track::Track;

/// Runs `track` against the simulated target and summarizes the results.
///
/// Cancelling `cancel` aborts the run. The summary of an aborted run is still returned, marked
/// as incomplete.
pub async fn run(track: &Track, config: &Config, cancel: CancellationToken) -> Result<Summary> {
    let target = Arc::new(SimulatedTarget::new(&config.target)?);
    let recorder = Arc::new(Recorder::new());

    tracing::info!(track = %track.name, workers = config.driver.workers, "running track");

    let collaborators = Collaborators::new(target, recorder.clone());
    let report = run_local(&track.schedule, &config.driver, collaborators, cancel).await;

    let summary = recorder.summarize(&report);
    if let Some(ref reason) = summary.reason {
        tracing::error!(track = %track.name, %reason, "track did not complete");
    }
    for warning in &summary.warnings {
        tracing::warn!(track = %track.name, "{warning}");
    }

    Ok(summary)
}
