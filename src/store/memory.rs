//! In-memory run record store for tests and single-node runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{RunStore, ThreadRef};
use crate::domain::run::{NewRun, Run, RunOutcome, RunStatus};
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, Run>,
    threads: HashMap<String, ThreadRef>,
    /// agent id -> owning account id
    agents: HashMap<String, String>,
}

/// Run store backed by process-local maps.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread and its ownership chain. Threads are managed by
    /// the surrounding CRUD layer in production; tests seed them here.
    pub fn insert_thread(&self, thread_id: &str, project_id: &str, account_id: &str) {
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        inner.threads.insert(
            thread_id.to_string(),
            ThreadRef {
                id: thread_id.to_string(),
                project_id: project_id.to_string(),
                account_id: account_id.to_string(),
            },
        );
    }

    /// Register an agent's owning account.
    pub fn insert_agent(&self, agent_id: &str, account_id: &str) {
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        inner
            .agents
            .insert(agent_id.to_string(), account_id.to_string());
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, new_run: NewRun) -> ControlResult<Run> {
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4().to_string(),
            thread_id: new_run.thread_id,
            agent_id: new_run.agent_id,
            agent_version_id: new_run.agent_version_id,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            error: None,
            metadata: new_run.metadata,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> ControlResult<Option<Run>> {
        let inner = self.inner.lock().expect("run store lock poisoned");
        Ok(inner.runs.get(run_id).cloned())
    }

    async fn mark_processing(&self, run_id: &str) -> ControlResult<bool> {
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        match inner.runs.get_mut(run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = RunStatus::Processing;
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_run(&self, run_id: &str, outcome: RunOutcome) -> ControlResult<Run> {
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ControlError::NotFound(run_id.to_string()))?;
        if run.is_terminal() {
            return Err(ControlError::AlreadyTerminal {
                id: run.id.clone(),
                status: run.status,
            });
        }
        let now = Utc::now();
        run.status = outcome.status;
        run.error = outcome.error;
        run.completed_at = Some(now);
        run.updated_at = now;
        if let Some(output) = outcome.output {
            run.metadata["output"] = output;
        }
        Ok(run.clone())
    }

    async fn inflight_runs_started_before(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<Run>> {
        let inner = self.inner.lock().expect("run store lock poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                matches!(run.status, RunStatus::Running | RunStatus::Processing)
                    && run.started_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn running_count_for_account(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> ControlResult<i64> {
        let inner = self.inner.lock().expect("run store lock poisoned");
        let count = inner
            .runs
            .values()
            .filter(|run| {
                matches!(run.status, RunStatus::Running | RunStatus::Processing)
                    && run.started_at >= since
            })
            .filter(|run| {
                run.agent_id
                    .as_ref()
                    .and_then(|agent| inner.agents.get(agent))
                    .is_some_and(|owner| owner == account_id)
            })
            .count();
        Ok(count as i64)
    }

    async fn find_active_run_for_project(&self, project_id: &str) -> ControlResult<Option<Run>> {
        let inner = self.inner.lock().expect("run store lock poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|run| matches!(run.status, RunStatus::Running | RunStatus::Processing))
            .filter(|run| {
                inner
                    .threads
                    .get(&run.thread_id)
                    .is_some_and(|thread| thread.project_id == project_id)
            })
            // Deterministic tie-break: most recently started wins.
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned())
    }

    async fn get_thread(&self, thread_id: &str) -> ControlResult<Option<ThreadRef>> {
        let inner = self.inner.lock().expect("run store lock poisoned");
        Ok(inner.threads.get(thread_id).cloned())
    }
}
