use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tower_http::trace::TraceLayer;

use tracing::{info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::coordination::{CoordinationStore, MemoryStore, RedisStore};
use crate::executor::worker::{AgentInvoker, RunWorker};
use crate::executor::{Dispatcher, LocalDispatcher};
use crate::runs::admission::AdmissionController;
use crate::runs::manager::RunManager;
use crate::runs::reaper::spawn_reaper;
use crate::api;
use crate::security;
use crate::store::{MemoryRunStore, PostgresRunStore, RunStore};

/// Start the Axum server with the provided configuration.
///
/// The invoker is the seam to the external model integration; the binary
/// wires a stand-in, deployments provide their own.
pub async fn start_server(
    config: Arc<AppConfig>,
    invoker: Arc<dyn AgentInvoker>,
) -> anyhow::Result<()> {
    let instance_id = Uuid::new_v4().to_string();
    info!(
        name: "instance.started",
        instance_id = %instance_id,
        "control plane instance starting"
    );

    // Initialize the run record store based on config
    let runs: Arc<dyn RunStore> = match config.persistence.provider.as_str() {
        "postgres" => {
            let store = PostgresRunStore::connect(&config.persistence.database_url).await?;
            Arc::new(store)
        }
        _ => Arc::new(MemoryRunStore::new()),
    };

    // Initialize the coordination store based on config
    let coordination: Arc<dyn CoordinationStore> = match config.coordination.provider.as_str() {
        "redis" => Arc::new(RedisStore::new(config.redis_settings())?),
        _ => Arc::new(MemoryStore::new()),
    };
    // Eager probe so misconfiguration shows up at startup, not first use.
    match coordination.ping().await {
        Ok(()) => info!(name: "coordination.ready", "coordination store reachable"),
        Err(err) => warn!(error = %err, "coordination store unreachable at startup"),
    }

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&runs),
        config.admission_settings(),
    ));

    let worker = Arc::new(RunWorker::new(
        Arc::clone(&runs),
        Arc::clone(&coordination),
        invoker,
        config.worker_settings(),
    ));
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(LocalDispatcher::new(worker, config.executor_settings()));

    let manager = Arc::new(RunManager::new(
        Arc::clone(&runs),
        Arc::clone(&coordination),
        Arc::clone(&admission),
        dispatcher,
        instance_id.clone(),
        config.presence_ttl(),
    ));

    let (reaper_handle, reaper_shutdown) = spawn_reaper(Arc::clone(&runs), config.reaper_settings());

    let state = AppState {
        manager: Arc::clone(&manager),
        admission,
        runs,
        coordination: Arc::clone(&coordination),
        config: config.clone(),
        instance_id: instance_id.clone(),
    };

    // Build router: the API surface sits behind auth, health does not.
    let protected = api::build_router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        security::middleware::auth_middleware,
    ));

    let timeout_duration = if config.resilience.timeout_disabled {
        Duration::from_secs(365 * 24 * 60 * 60) // effectively off
    } else {
        Duration::from_secs(30)
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", protected)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB limit
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let duration = timeout_duration;
                async move {
                    match tokio::time::timeout(duration, next.run(req)).await {
                        Ok(res) => res,
                        Err(_) => {
                            (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
                        }
                    }
                }
            },
        ))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown hook: no run this instance holds may be abandoned as
    // running-forever, and the store connection goes last.
    info!(name: "instance.draining", instance_id = %instance_id, "draining instance runs");
    manager.cleanup_instance_runs(&instance_id).await;
    let _ = reaper_shutdown.send(true);
    if tokio::time::timeout(Duration::from_secs(5), reaper_handle)
        .await
        .is_err()
    {
        warn!("reaper did not stop within the grace period");
    }
    coordination.close().await;
    info!(name: "instance.stopped", instance_id = %instance_id, "control plane instance stopped");

    Ok(())
}

/// GET /healthz - liveness, with a coordination-store reachability flag.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let coordination_ok = state.coordination.ping().await.is_ok();
    Json(json!({
        "status": "ok",
        "instance_id": state.instance_id,
        "coordination": coordination_ok,
    }))
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        _ = terminate => {},
    }
}
