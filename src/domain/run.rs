//! Run records and the run state machine.
//!
//! A run is one execution attempt of an asynchronous agent task:
//! `Pending -> Running -> Processing -> {Completed | Failed | Cancelled}`.
//! Terminal records are never mutated again; a retry creates a brand-new
//! run linked to its source through the `retry_of` metadata entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a stored error message. Longer messages are truncated
/// so a pathological worker failure cannot bloat the run record.
pub const MAX_ERROR_LEN: usize = 500;

/// Metadata key linking a retried run back to its source run.
pub const RETRY_OF_KEY: &str = "retry_of";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// The executor has begun substantive work. Signals progress for
    /// UI/telemetry; control logic treats it the same as `Running`.
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are immutable; anything else is stoppable.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative record of a single run, persisted in the run record store.
///
/// Invariant: `completed_at` is set if and only if `status` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    /// Owning thread; runs are only deleted by cascading deletion of it.
    pub thread_id: String,
    pub agent_id: Option<String>,
    pub agent_version_id: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Retryable means terminal-and-failed/cancelled: a completed run has
    /// nothing to retry, a live run must be stopped first.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, RunStatus::Failed | RunStatus::Cancelled)
    }
}

/// Parameters for creating a run record. The store stamps identity and
/// timestamps; new runs always enter in `Running`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub thread_id: String,
    pub agent_id: Option<String>,
    pub agent_version_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Terminal outcome applied to a run by the executor, the run manager's
/// stop path, or the reaper.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl RunOutcome {
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            status: RunStatus::Completed,
            error: None,
            output: Some(output),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(truncate_error(message.into())),
            output: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            error: None,
            output: None,
        }
    }
}

/// Truncate an error message to [`MAX_ERROR_LEN`] on a char boundary.
pub fn truncate_error(mut message: String) -> String {
    if message.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}
