//! Background stale-run reaper.
//!
//! The backstop for executor crashes that skip the worker's own cleanup:
//! runs stuck in `Running` past a deadline are forcibly failed. The reaper
//! only touches the run record store; orphaned coordination keys expire on
//! their own TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::run::RunOutcome;
use crate::error::{ControlError, ControlResult};
use crate::store::RunStore;

/// Error message stamped onto reaped runs.
const TIMED_OUT: &str = "timed out";

/// Configuration for the reaper task.
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    /// How often to run a sweep.
    pub interval: Duration,
    /// A `Running` run older than this is considered stuck.
    pub stale_after: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(60 * 60),
        }
    }
}

/// Background task that periodically fails stuck runs.
#[derive(Debug)]
pub struct StaleRunReaper {
    runs: Arc<dyn RunStore>,
    settings: ReaperSettings,
    shutdown_rx: watch::Receiver<bool>,
}

impl StaleRunReaper {
    pub fn new(
        runs: Arc<dyn RunStore>,
        settings: ReaperSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runs,
            settings,
            shutdown_rx,
        }
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            stale_after_secs = self.settings.stale_after.as_secs(),
            "stale-run reaper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("stale-run reaper shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.settings.interval) => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(reaped) => info!(reaped, "stale runs failed"),
                        Err(err) => error!(error = %err, "reaper sweep failed"),
                    }
                }
            }
        }
    }

    /// One sweep: fail every `Running` run started before the deadline.
    /// Runs newer than the deadline are never touched.
    pub async fn sweep(&self) -> ControlResult<usize> {
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - stale_after;
        let stale = self.runs.inflight_runs_started_before(cutoff).await?;

        let mut reaped = 0usize;
        for run in stale {
            match self
                .runs
                .finish_run(&run.id, RunOutcome::failed(TIMED_OUT))
                .await
            {
                Ok(_) => {
                    warn!(run_id = %run.id, thread_id = %run.thread_id, "reaped stale run");
                    reaped += 1;
                }
                // Another writer finished it between query and update.
                Err(ControlError::AlreadyTerminal { .. } | ControlError::NotFound(_)) => {
                    debug!(run_id = %run.id, "stale run finished before reaping");
                }
                Err(err) => {
                    error!(run_id = %run.id, error = %err, "failed to reap stale run");
                }
            }
        }
        Ok(reaped)
    }
}

/// Spawn the reaper, returning its join handle and a shutdown trigger.
pub fn spawn_reaper(
    runs: Arc<dyn RunStore>,
    settings: ReaperSettings,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = StaleRunReaper::new(runs, settings, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
