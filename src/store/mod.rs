//! Authoritative run record store.
//!
//! Survives coordination-store restarts; the row-level update is the
//! serialization point for a run's terminal state. Terminal transitions go
//! through compare-and-swap helpers so a losing writer gets
//! `AlreadyTerminal` instead of silently clobbering a finished run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::run::{NewRun, Run, RunOutcome};
use crate::error::ControlResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryRunStore;
pub use postgres::PostgresRunStore;

/// A run's owning thread, resolved up its ownership chain.
#[derive(Debug, Clone)]
pub struct ThreadRef {
    pub id: String,
    pub project_id: String,
    pub account_id: String,
}

/// Contract consumed from the relational store.
#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    /// Create a run record entering in `Running` with `started_at = now`.
    async fn create_run(&self, new_run: NewRun) -> ControlResult<Run>;

    async fn get_run(&self, run_id: &str) -> ControlResult<Option<Run>>;

    /// Compare-and-swap `Running -> Processing`. Returns `false` when the
    /// run is no longer `Running` (stale or duplicate dispatch).
    async fn mark_processing(&self, run_id: &str) -> ControlResult<bool>;

    /// Compare-and-swap a non-terminal run into a terminal status, stamping
    /// `completed_at` and merging any output into metadata. Fails with
    /// `AlreadyTerminal` if another writer finished the run first, without
    /// touching `updated_at`.
    async fn finish_run(&self, run_id: &str, outcome: RunOutcome) -> ControlResult<Run>;

    /// All in-flight (`Running` or `Processing`) runs started strictly
    /// before `cutoff`. Feeds the reaper; `Processing` is included so a
    /// worker crash after the processing handoff still has a bounded
    /// stuck time.
    async fn inflight_runs_started_before(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<Run>>;

    /// Count of in-flight runs started at or after `since` whose agent
    /// belongs to the account (the agent-ownership chain). `Processing`
    /// counts: the status split is for telemetry, not control logic.
    async fn running_count_for_account(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> ControlResult<i64>;

    /// The most recently started in-flight run among the project's
    /// threads, if any. Read-only; an empty project yields `None`.
    async fn find_active_run_for_project(&self, project_id: &str) -> ControlResult<Option<Run>>;

    /// Resolve a thread up its ownership chain.
    async fn get_thread(&self, thread_id: &str) -> ControlResult<Option<ThreadRef>>;
}
