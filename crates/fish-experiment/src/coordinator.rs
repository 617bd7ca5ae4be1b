//! Runs every available round, with image acquisition in between.
//!
//! For each round the coordinator spawns the worker, joins it and, if the
//! round left the acquire flag set, calls the image acquirer. A failed
//! acquisition is reported and the operator decides: `again` retries with
//! the same arguments, any other answer continues without images. Fluidics
//! are never rolled back.
//!
//! A failed or stopped round ends the run; the round stays available. A stop
//! ends the run with a summary, any other failure with the error.

use fish_core::capabilities::ImageAcquirer;
use fish_core::error::{AppResult, FluidicsError};
use fish_core::operator::OperatorPort;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::robot::{spawn_round_in_run, Robot, StopHandle};

/// Operator answer that retries a failed acquisition.
pub const RETRY_ANSWER: &str = "again";

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Completed rounds, in run order.
    pub completed: Vec<String>,
    /// Rounds imaged successfully.
    pub imaged: Vec<String>,
    /// Rounds whose acquisition was given up or skipped.
    pub not_imaged: Vec<String>,
    /// The run ended on a stop request, during or between rounds.
    pub stopped: bool,
}

/// Drives a whole experiment.
pub struct RunCoordinator {
    robot: Arc<Mutex<Robot>>,
    acquirer: Option<Arc<dyn ImageAcquirer>>,
    operator: Arc<dyn OperatorPort>,
    stop: StopHandle,
}

impl RunCoordinator {
    /// Coordinator owning `robot`.
    pub fn new(
        robot: Robot,
        acquirer: Option<Arc<dyn ImageAcquirer>>,
        operator: Arc<dyn OperatorPort>,
    ) -> Self {
        let stop = robot.stop_handle();
        Self {
            robot: Arc::new(Mutex::new(robot)),
            acquirer,
            operator,
            stop,
        }
    }

    /// Shared robot, for status queries between rounds.
    pub fn robot(&self) -> Arc<Mutex<Robot>> {
        Arc::clone(&self.robot)
    }

    /// Handle for stop requests while a run is in progress.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run rounds until none is available, a round fails or a stop is requested.
    #[instrument(skip(self, save_dir), fields(save_dir = %save_dir.display()), err)]
    pub async fn run_all_rounds(&self, save_dir: &Path) -> AppResult<RunSummary> {
        self.stop.reset();
        let mut summary = RunSummary::default();

        loop {
            if self.stop.is_stop_requested() {
                warn!("Stop requested, no further rounds started");
                summary.stopped = true;
                break;
            }

            let next = self.robot.lock().await.available_rounds().first().cloned();
            let Some(round_id) = next else {
                info!("No more rounds available");
                break;
            };

            let result = spawn_round_in_run(Arc::clone(&self.robot), round_id.clone())
                .await
                .map_err(|e| {
                    FluidicsError::Hardware(anyhow::anyhow!("Round worker failed: {}", e))
                })?;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => {
                    warn!(round = %round_id, "Round stopped, run ends");
                    summary.stopped = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            summary.completed.push(round_id.clone());

            if outcome.acquire {
                if self.acquire_with_retry(save_dir, &round_id).await? {
                    summary.imaged.push(round_id);
                } else {
                    summary.not_imaged.push(round_id);
                }
            } else {
                info!(round = %round_id, "Round asked to skip imaging");
                summary.not_imaged.push(round_id);
            }
        }

        info!(?summary, "Run finished");
        Ok(summary)
    }

    /// Acquire images for `name_base`; returns whether images were taken.
    pub async fn acquire_with_retry(&self, save_dir: &Path, name_base: &str) -> AppResult<bool> {
        let Some(acquirer) = &self.acquirer else {
            warn!("No image acquirer configured, skipping acquisition");
            return Ok(false);
        };

        loop {
            info!(name_base, "Launching image acquisition");
            match acquirer.acquire_images(save_dir, name_base).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    error!(error = %format!("{:#}", e), name_base, "Image acquisition failed");
                    self.operator
                        .notify(&format!("Image acquisition failed for {}", name_base));
                    let answer = self
                        .operator
                        .ask("Type 'again' to retry the acquisition, anything else to continue without images")
                        .await?;
                    if answer.trim() != RETRY_ANSWER {
                        warn!(name_base, "Continuing without images");
                        return Ok(false);
                    }
                    info!(name_base, "Retrying acquisition");
                }
            }
        }
    }
}
