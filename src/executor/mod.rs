//! Background execution dispatch.
//!
//! The dispatch queue is a narrow seam: [`Dispatcher::submit`] hands a
//! typed task to an out-of-process worker under at-least-once delivery.
//! [`LocalDispatcher`] is the in-process implementation used by
//! single-binary deployments: it spawns the worker with bounded retries
//! under a hard wall-clock budget. Retries are safe only because the
//! worker's first step aborts on anything but a `Running` record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::ControlResult;

pub mod worker;

pub use worker::{AgentInvoker, EchoInvoker, RunWorker, StepLog, StepRecord};

/// Closed set of background task variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    ExecuteRun(ExecuteRun),
}

/// Payload for executing one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRun {
    pub run_id: String,
    pub thread_id: String,
    /// Instance whose presence key the worker owns and must clear.
    pub instance_id: String,
    /// Model/task parameters, opaque to the control plane.
    pub params: serde_json::Value,
}

/// Contract for handing work to the dispatch queue.
#[async_trait]
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    async fn submit(&self, task: Task) -> ControlResult<()>;
}

/// Retry and budget knobs for in-process execution.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Wall-clock budget covering all attempts of one task.
    pub hard_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            hard_timeout: Duration::from_secs(10 * 60),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Dispatcher that executes tasks on the local runtime.
#[derive(Debug)]
pub struct LocalDispatcher {
    worker: Arc<RunWorker>,
    settings: ExecutorSettings,
}

impl LocalDispatcher {
    pub fn new(worker: Arc<RunWorker>, settings: ExecutorSettings) -> Self {
        Self { worker, settings }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, task: Task) -> ControlResult<()> {
        match task {
            Task::ExecuteRun(job) => {
                let worker = Arc::clone(&self.worker);
                let settings = self.settings.clone();
                tokio::spawn(execute_with_budget(worker, job, settings));
            }
        }
        Ok(())
    }
}

async fn execute_with_budget(worker: Arc<RunWorker>, job: ExecuteRun, settings: ExecutorSettings) {
    let attempts = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match worker.execute(&job).await {
                Ok(()) => return,
                Err(err) if attempt <= settings.max_retries => {
                    warn!(
                        run_id = %job.run_id,
                        attempt,
                        error = %err,
                        "worker attempt failed, retrying"
                    );
                    tokio::time::sleep(settings.retry_delay).await;
                }
                Err(err) => {
                    // The run record could not be finalized here either;
                    // the reaper bounds how long it can stay stuck.
                    error!(
                        run_id = %job.run_id,
                        attempts = attempt,
                        error = %err,
                        "worker failed permanently"
                    );
                    return;
                }
            }
        }
    };

    if tokio::time::timeout(settings.hard_timeout, attempts)
        .await
        .is_err()
    {
        error!(run_id = %job.run_id, "execution exceeded hard budget");
        // The in-flight attempt was cancelled, skipping its finalizer.
        worker.abandon(&job, "execution budget exceeded").await;
    }
}
