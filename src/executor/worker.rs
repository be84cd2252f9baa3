//! The executing side of the dispatch contract.
//!
//! A worker receiving a task:
//! 1. loads the run record and aborts on anything but `Running` (stale or
//!    duplicate delivery),
//! 2. transitions to `Processing` (compare-and-swap),
//! 3. performs the opaque unit of work while watching the run's control
//!    topics for `STOP`,
//! 4./5. writes the terminal outcome (output on success, truncated error
//!    on failure), tolerating a concurrent `stop_run` having won,
//! 6. deletes this instance's presence key, on every path out of 2-5.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::ExecuteRun;
use crate::coordination::{CoordinationStore, STOP_SIGNAL, Subscription, keys};
use crate::domain::run::{RunOutcome, RunStatus};
use crate::error::{ControlError, ControlResult};
use crate::store::RunStore;

/// One entry in a run's ordered step log.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub at: DateTime<Utc>,
}

/// Monotonic step log accumulated during a multi-step sub-workflow.
/// Indices are assigned under the lock, so entries are strictly ordered
/// even when steps are recorded from concurrent sub-tasks.
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    entries: Arc<Mutex<Vec<StepRecord>>>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step, returning its index.
    pub fn record(&self, name: &str) -> usize {
        let mut entries = self.entries.lock().expect("step log lock poisoned");
        let index = entries.len();
        entries.push(StepRecord {
            index,
            name: name.to_string(),
            at: Utc::now(),
        });
        index
    }

    pub fn snapshot(&self) -> Vec<StepRecord> {
        self.entries.lock().expect("step log lock poisoned").clone()
    }
}

/// The opaque unit of work (e.g. an LLM invocation). Implementations
/// record progress through the step log; cancellation is handled outside
/// by dropping the future.
#[async_trait]
pub trait AgentInvoker: Send + Sync + std::fmt::Debug {
    async fn invoke(&self, job: &ExecuteRun, steps: &StepLog) -> ControlResult<serde_json::Value>;
}

/// Stand-in invoker that echoes the task parameters back as output.
/// Deployments replace this with the real model integration.
#[derive(Debug, Default)]
pub struct EchoInvoker;

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(&self, job: &ExecuteRun, steps: &StepLog) -> ControlResult<serde_json::Value> {
        steps.record("echo");
        Ok(job.params.clone())
    }
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// TTL applied to the response-buffer key.
    pub response_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            response_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Executes dispatched runs against the run record store and the
/// coordination store.
#[derive(Debug)]
pub struct RunWorker {
    runs: Arc<dyn RunStore>,
    coordination: Arc<dyn CoordinationStore>,
    invoker: Arc<dyn AgentInvoker>,
    settings: WorkerSettings,
}

impl RunWorker {
    pub fn new(
        runs: Arc<dyn RunStore>,
        coordination: Arc<dyn CoordinationStore>,
        invoker: Arc<dyn AgentInvoker>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            runs,
            coordination,
            invoker,
            settings,
        }
    }

    /// Handle one dispatched task. Errors are infrastructure failures the
    /// dispatch layer may retry; task failures are recorded into the run
    /// record and return `Ok`.
    #[instrument(skip(self, job), fields(run_id = %job.run_id))]
    pub async fn execute(&self, job: &ExecuteRun) -> ControlResult<()> {
        let Some(run) = self.runs.get_run(&job.run_id).await? else {
            warn!("dispatch for unknown run, aborting");
            return Ok(());
        };
        if run.status != RunStatus::Running {
            info!(status = %run.status, "stale or duplicate dispatch, aborting");
            return Ok(());
        }
        if !self.runs.mark_processing(&job.run_id).await? {
            info!("lost processing handoff, aborting");
            return Ok(());
        }

        let result = self.run_to_completion(job).await;

        // Unconditional finalizer: the presence key must go even when the
        // work or the terminal write failed.
        let key = keys::presence_key(&job.instance_id, &job.run_id);
        if let Err(err) = self.coordination.delete(&key).await {
            warn!(key, error = %err, "failed to delete presence key, TTL will reclaim it");
        }

        result
    }

    async fn run_to_completion(&self, job: &ExecuteRun) -> ControlResult<()> {
        // Cancellation listeners are best-effort: without the coordination
        // store the run still executes, it just cannot be stopped early.
        let mut stop_global = self.listen(&keys::control_topic(&job.run_id)).await;
        let mut stop_instance = self
            .listen(&keys::instance_control_topic(&job.run_id, &job.instance_id))
            .await;

        let steps = StepLog::new();
        let work = self.invoker.invoke(job, &steps);
        tokio::pin!(work);

        let outcome = tokio::select! {
            result = &mut work => match result {
                Ok(output) => {
                    self.buffer_response(&job.run_id, &output).await;
                    RunOutcome::completed(serde_json::json!({
                        "result": output,
                        "steps": steps.snapshot(),
                    }))
                }
                Err(err) => RunOutcome::failed(err.to_string()),
            },
            _ = wait_for_stop(&mut stop_global) => {
                info!("stop signal received, cancelling work");
                RunOutcome::cancelled()
            }
            _ = wait_for_stop(&mut stop_instance) => {
                info!("instance stop signal received, cancelling work");
                RunOutcome::cancelled()
            }
        };

        let status = outcome.status;
        match self.runs.finish_run(&job.run_id, outcome).await {
            Ok(_) => {
                info!(status = %status, "run finished");
                Ok(())
            }
            Err(ControlError::AlreadyTerminal { status, .. }) => {
                // A concurrent stop_run won the terminal write.
                info!(winner = %status, "run was finished by another writer");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Last-resort cleanup after the dispatch layer cancelled an attempt
    /// mid-flight, skipping the normal finalizer.
    pub async fn abandon(&self, job: &ExecuteRun, reason: &str) {
        match self
            .runs
            .finish_run(&job.run_id, RunOutcome::failed(reason))
            .await
        {
            Ok(_) | Err(ControlError::AlreadyTerminal { .. }) => {}
            Err(err) => warn!(run_id = %job.run_id, error = %err, "failed to abandon run"),
        }
        let key = keys::presence_key(&job.instance_id, &job.run_id);
        if let Err(err) = self.coordination.delete(&key).await {
            warn!(key, error = %err, "failed to delete presence key, TTL will reclaim it");
        }
    }

    async fn listen(&self, topic: &str) -> Option<Subscription> {
        match self.coordination.subscribe(topic).await {
            Ok(sub) => Some(sub),
            Err(err) => {
                warn!(topic, error = %err, "control topic unavailable, run is not stoppable early");
                None
            }
        }
    }

    async fn buffer_response(&self, run_id: &str, output: &serde_json::Value) {
        let payload = output.to_string();
        if let Err(err) = self
            .coordination
            .set(
                &keys::response_key(run_id),
                &payload,
                Some(self.settings.response_ttl),
                false,
            )
            .await
        {
            warn!(run_id, error = %err, "failed to buffer run response");
        }
    }
}

/// Resolve once a STOP token arrives on the subscription; never resolves
/// when the listener is absent or its channel closes.
async fn wait_for_stop(subscription: &mut Option<Subscription>) {
    if let Some(sub) = subscription.as_mut() {
        while let Some(message) = sub.recv().await {
            if message == STOP_SIGNAL {
                return;
            }
        }
    }
    std::future::pending::<()>().await
}
