//! Error taxonomy for the control plane.
//!
//! The durable database write is the only operation allowed to fail an
//! overall call; coordination-store side effects downstream of a successful
//! durable write are best-effort and logged at the call site.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::domain::run::RunStatus;

/// Errors surfaced by run-control operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The referenced run or thread does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stop was requested for a run that already reached a terminal status.
    #[error("run {id} is already terminal ({status})")]
    AlreadyTerminal { id: String, status: RunStatus },

    /// Retry was requested for a run that is not in a retryable state.
    #[error("run {id} cannot be retried from status {status}")]
    NotRetryable { id: String, status: RunStatus },

    /// The coordination store is unreachable. Swallowed on cleanup and
    /// admission paths, surfaced on durable-write-adjacent paths.
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// The calling principal lacks access.
    #[error("unauthorized")]
    Unauthorized,

    /// Admission control denied a new run.
    #[error("run limit reached ({running_count} of {limit} concurrent runs)")]
    QuotaExceeded { running_count: i64, limit: i64 },

    /// The project already has an active run.
    #[error("project {0} already has an active run")]
    ProjectBusy(String),

    /// Run record store failure (the durable path).
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Opaque task failure reported by the worker. Recorded into the run's
    /// error field, never propagated as a process crash.
    #[error("worker failure: {0}")]
    Worker(String),
}

impl ControlError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyTerminal { .. } | Self::NotRetryable { .. } | Self::ProjectBusy(_) => {
                StatusCode::CONFLICT
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({ "error": self.to_string() });
        if let Self::QuotaExceeded {
            running_count,
            limit,
        } = &self
        {
            body["running_count"] = json!(running_count);
            body["limit"] = json!(limit);
        }
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

/// Result alias used across the control plane.
pub type ControlResult<T> = Result<T, ControlError>;
