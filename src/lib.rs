//! Runplane
//!
//! A distributed agent-run control plane: many stateless API/worker
//! processes jointly supervise long-running agent executions, so any
//! instance can start, observe, cancel, or reap a run owned by any other
//! instance.
//!
//! # Architecture
//!
//! - **Run record store**: authoritative relational state (Postgres);
//!   the row-level update is the serialization point for terminal writes
//! - **Coordination store**: key/value with TTL plus pub/sub (Redis);
//!   presence keys and STOP broadcasts, advisory only
//! - **Background executor**: typed dispatch with bounded retries, an
//!   idempotent worker, and an unconditional presence-key finalizer
//! - **Reaper**: hourly sweep force-failing runs stuck past a deadline
//!
//! # Modules
//!
//! - [`domain`]: run records and the run state machine
//! - [`coordination`]: shared-store client and the key/topic wire contract
//! - [`store`]: run record store trait and providers
//! - [`runs`]: run manager, admission control, stale-run reaper
//! - [`executor`]: dispatch contract and the executing worker

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod api;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod executor;
pub mod runs;
pub mod security;
pub mod server;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::coordination::CoordinationStore;
use crate::runs::admission::AdmissionController;
use crate::runs::manager::RunManager;
use crate::store::RunStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Run Manager
    pub manager: Arc<RunManager>,
    /// Admission Controller
    pub admission: Arc<AdmissionController>,
    /// Run Record Store
    pub runs: Arc<dyn RunStore>,
    /// Coordination Store
    pub coordination: Arc<dyn CoordinationStore>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// This process's instance id
    pub instance_id: String,
}
