//! Run lifecycle management across instances.
//!
//! The durable run record write is the authoritative action everywhere in
//! this module; coordination-store traffic (STOP broadcasts, presence-key
//! deletes, response buffers) is an advisory fast path. Partial cleanup
//! cannot corrupt state, it only leaves keys that expire on their TTL.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::coordination::{CoordinationStore, STOP_SIGNAL, keys};
use crate::domain::run::{NewRun, RETRY_OF_KEY, Run, RunOutcome};
use crate::error::{ControlError, ControlResult};
use crate::executor::{Dispatcher, ExecuteRun, Task};
use crate::runs::admission::AdmissionController;
use crate::store::RunStore;

/// Reason stamped onto runs stopped by a draining instance.
const INSTANCE_SHUTDOWN_REASON: &str = "instance shutting down";

/// Request to start a run.
#[derive(Debug, Clone)]
pub struct StartRun {
    pub thread_id: String,
    pub agent_id: Option<String>,
    pub agent_version_id: Option<String>,
    /// Model/task parameters forwarded opaquely to the executor.
    pub params: serde_json::Value,
    /// Principal from the authorization layer; falls back to the thread's
    /// owning account when absent.
    pub account_id: Option<String>,
    /// Extra metadata entries merged into the run record.
    pub metadata: serde_json::Value,
}

/// Coordinates run starts, stops, and instance cleanup for one process.
#[derive(Debug)]
pub struct RunManager {
    runs: Arc<dyn RunStore>,
    coordination: Arc<dyn CoordinationStore>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<dyn Dispatcher>,
    instance_id: String,
    presence_ttl: Duration,
}

impl RunManager {
    pub fn new(
        runs: Arc<dyn RunStore>,
        coordination: Arc<dyn CoordinationStore>,
        admission: Arc<AdmissionController>,
        dispatcher: Arc<dyn Dispatcher>,
        instance_id: String,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            runs,
            coordination,
            admission,
            dispatcher,
            instance_id,
            presence_ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Start a run: admission check, per-project exclusivity, durable
    /// record, presence key, dispatch.
    #[instrument(skip(self, request), fields(thread_id = %request.thread_id, run_id = tracing::field::Empty))]
    pub async fn start_run(&self, request: StartRun) -> ControlResult<Run> {
        let thread = self
            .runs
            .get_thread(&request.thread_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("thread {}", request.thread_id)))?;

        let account_id = request
            .account_id
            .clone()
            .unwrap_or_else(|| thread.account_id.clone());
        let decision = self.admission.check_run_limit(&account_id).await;
        if !decision.can_start {
            info!(
                account_id,
                running_count = decision.running_count,
                limit = decision.limit,
                "run rejected by admission control"
            );
            return Err(ControlError::QuotaExceeded {
                running_count: decision.running_count,
                limit: decision.limit,
            });
        }

        if let Some(active) = self
            .runs
            .find_active_run_for_project(&thread.project_id)
            .await?
        {
            info!(active_run_id = %active.id, "project already has an active run");
            return Err(ControlError::ProjectBusy(thread.project_id));
        }

        let mut metadata = json!({ "params": request.params.clone() });
        if let Some(extra) = request.metadata.as_object() {
            for (key, value) in extra {
                metadata[key] = value.clone();
            }
        }

        let run = self
            .runs
            .create_run(NewRun {
                thread_id: request.thread_id.clone(),
                agent_id: request.agent_id.clone(),
                agent_version_id: request.agent_version_id.clone(),
                metadata,
            })
            .await?;
        tracing::Span::current().record("run_id", run.id.as_str());
        info!(name: "run.started", run_id = %run.id, "run record created");

        // Presence is a TTL-bounded safety net, not control state; losing
        // the write only delays discovery until the record store is asked.
        let presence = keys::presence_key(&self.instance_id, &run.id);
        if let Err(err) = self
            .coordination
            .set(
                &presence,
                run.status.as_str(),
                Some(self.presence_ttl),
                false,
            )
            .await
        {
            warn!(key = %presence, error = %err, "failed to write presence key");
        }

        let task = Task::ExecuteRun(ExecuteRun {
            run_id: run.id.clone(),
            thread_id: request.thread_id,
            instance_id: self.instance_id.clone(),
            params: request.params,
        });
        if let Err(err) = self.dispatcher.submit(task).await {
            // Without a dispatch the run would hang until the reaper; fail
            // it durably now and surface the submit error.
            warn!(run_id = %run.id, error = %err, "dispatch failed, failing run");
            let _ = self
                .runs
                .finish_run(&run.id, RunOutcome::failed("dispatch failed"))
                .await;
            let _ = self.coordination.delete(&presence).await;
            return Err(err);
        }

        Ok(run)
    }

    /// Stop a run. The terminal record write must succeed or the whole
    /// call fails; everything after it is best-effort cleanup.
    #[instrument(skip(self))]
    pub async fn stop_run(&self, run_id: &str, reason: Option<&str>) -> ControlResult<Run> {
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("run {run_id}")))?;
        if run.is_terminal() {
            return Err(ControlError::AlreadyTerminal {
                id: run.id,
                status: run.status,
            });
        }

        // (a) durable, authoritative stop
        let outcome = match reason {
            Some(reason) => RunOutcome::failed(reason),
            None => RunOutcome::cancelled(),
        };
        let stopped = self.runs.finish_run(run_id, outcome).await?;
        info!(name: "run.stopped", status = %stopped.status, "run durably stopped");

        // (b)-(d) advisory cleanup
        self.broadcast_stop(run_id).await;

        Ok(stopped)
    }

    /// Publish STOP and clear the run's coordination keys. Failures are
    /// logged and swallowed: the run is already durably stopped, and
    /// orphaned keys expire on their TTL.
    async fn broadcast_stop(&self, run_id: &str) {
        if let Err(err) = self
            .coordination
            .publish(&keys::control_topic(run_id), STOP_SIGNAL)
            .await
        {
            warn!(run_id, error = %err, "failed to publish stop signal");
        }

        match self
            .coordination
            .scan(&keys::run_presence_pattern(run_id))
            .await
        {
            Ok(presence_keys) => {
                for key in presence_keys {
                    if let Some((instance_id, _)) = keys::parse_presence_key(&key) {
                        if let Err(err) = self
                            .coordination
                            .publish(
                                &keys::instance_control_topic(run_id, instance_id),
                                STOP_SIGNAL,
                            )
                            .await
                        {
                            warn!(run_id, instance_id, error = %err, "failed to publish instance stop");
                        }
                    }
                    if let Err(err) = self.coordination.delete(&key).await {
                        warn!(key, error = %err, "failed to delete presence key");
                    }
                }
            }
            Err(err) => {
                warn!(run_id, error = %err, "presence scan failed, keys will expire via TTL");
            }
        }

        if let Err(err) = self
            .coordination
            .delete(&keys::response_key(run_id))
            .await
        {
            warn!(run_id, error = %err, "failed to delete response buffer");
        }
    }

    /// Stop every run this instance holds a presence key for. Called from
    /// the shutdown hook so a draining instance never abandons a run as
    /// running-forever. Never fails the caller; returns the stop count.
    #[instrument(skip(self))]
    pub async fn cleanup_instance_runs(&self, instance_id: &str) -> usize {
        let pattern = keys::instance_presence_pattern(instance_id);
        let presence_keys = match self.coordination.scan(&pattern).await {
            Ok(found) => found,
            Err(err) => {
                warn!(instance_id, error = %err, "instance cleanup scan failed");
                return 0;
            }
        };

        let mut stopped = 0usize;
        for key in presence_keys {
            let Some((_, run_id)) = keys::parse_presence_key(&key) else {
                continue;
            };
            let run_id = run_id.to_string();
            match self.stop_run(&run_id, Some(INSTANCE_SHUTDOWN_REASON)).await {
                Ok(_) => stopped += 1,
                Err(ControlError::AlreadyTerminal { .. } | ControlError::NotFound(_)) => {}
                Err(err) => {
                    warn!(run_id, error = %err, "failed to stop run during instance cleanup");
                }
            }
            // The key must go even when the record was already terminal.
            let _ = self.coordination.delete(&key).await;
        }

        if stopped > 0 {
            info!(instance_id, stopped, "instance runs cleaned up");
        }
        stopped
    }

    /// Read-only existence check: the project's active run, if any, with
    /// the most recently started one winning ties.
    pub async fn find_active_run_for_project(
        &self,
        project_id: &str,
    ) -> ControlResult<Option<Run>> {
        self.runs.find_active_run_for_project(project_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> ControlResult<Option<Run>> {
        self.runs.get_run(run_id).await
    }

    /// Create a new run copying a finished run's configuration. The source
    /// must be terminal-and-failed/cancelled; the new record links back
    /// through `retry_of` metadata.
    #[instrument(skip(self))]
    pub async fn retry_run(&self, run_id: &str, account_id: Option<String>) -> ControlResult<Run> {
        let source = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("run {run_id}")))?;
        if !source.is_retryable() {
            return Err(ControlError::NotRetryable {
                id: source.id,
                status: source.status,
            });
        }

        let params = source
            .metadata
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        self.start_run(StartRun {
            thread_id: source.thread_id.clone(),
            agent_id: source.agent_id.clone(),
            agent_version_id: source.agent_version_id.clone(),
            params,
            account_id,
            metadata: json!({ RETRY_OF_KEY: source.id }),
        })
        .await
    }
}
