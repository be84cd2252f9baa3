//! HTTP surface for run control.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;
use crate::domain::run::{Run, RunStatus};
use crate::error::ControlError;
use crate::runs::manager::StartRun;
use crate::security::claims::Principal;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/agent-runs", post(start_run))
        .route("/agent-runs/{id}", get(get_run))
        .route("/agent-runs/{id}/stop", post(stop_run))
        .route("/agent-runs/{id}/retry", post(retry_run))
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    thread_id: String,
    agent_id: Option<String>,
    agent_version_id: Option<String>,
    /// Model/task parameters forwarded opaquely to the executor.
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct StartRunResponse {
    run_id: String,
    status: RunStatus,
}

/// POST /agent-runs - Start a run.
async fn start_run(
    State(state): State<AppState>,
    Principal(principal): Principal,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), ControlError> {
    let run = state
        .manager
        .start_run(StartRun {
            thread_id: req.thread_id,
            agent_id: req.agent_id,
            agent_version_id: req.agent_version_id,
            params: req.params,
            account_id: principal.map(|p| p.account_id),
            metadata: json!({}),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartRunResponse {
            run_id: run.id,
            status: run.status,
        }),
    ))
}

/// GET /agent-runs/:id - Fetch a run record.
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ControlError> {
    match state.manager.get_run(&id).await? {
        Some(run) => Ok(Json(run)),
        None => Err(ControlError::NotFound(format!("run {id}"))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StopRunRequest {
    /// When given, the run ends `Failed` with this reason; otherwise
    /// `Cancelled`.
    reason: Option<String>,
}

/// POST /agent-runs/:id/stop - Durably stop a run.
async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StopRunRequest>>,
) -> Result<Json<Run>, ControlError> {
    let reason = body.and_then(|Json(req)| req.reason);
    let run = state.manager.stop_run(&id, reason.as_deref()).await?;
    Ok(Json(run))
}

/// POST /agent-runs/:id/retry - Start a new run copying a failed or
/// cancelled run's configuration.
async fn retry_run(
    State(state): State<AppState>,
    Principal(principal): Principal,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StartRunResponse>), ControlError> {
    let run = state
        .manager
        .retry_run(&id, principal.map(|p| p.account_id))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StartRunResponse {
            run_id: run.id,
            status: run.status,
        }),
    ))
}
