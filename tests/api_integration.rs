//! HTTP surface tests: routing, status codes, and error payloads.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use runplane::AppState;
use runplane::config::AppConfig;
use runplane::coordination::{CoordinationStore, MemoryStore};
use runplane::executor::worker::{EchoInvoker, RunWorker};
use runplane::executor::{Dispatcher, LocalDispatcher};
use runplane::runs::admission::AdmissionController;
use runplane::runs::manager::RunManager;
use runplane::security;
use runplane::store::{MemoryRunStore, RunStore};

fn build_app(jwt_required: bool) -> (Router, Arc<MemoryRunStore>) {
    let args: Vec<&str> = if jwt_required {
        vec!["runplane"]
    } else {
        vec!["runplane", "--jwt-required", "false"]
    };
    let config = AppConfig::load_from_args(args)
        .expect("config should load")
        .into_shared();

    let runs = Arc::new(MemoryRunStore::new());
    let coordination: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&runs) as Arc<dyn RunStore>,
        config.admission_settings(),
    ));
    let worker = Arc::new(RunWorker::new(
        Arc::clone(&runs) as Arc<dyn RunStore>,
        Arc::clone(&coordination),
        Arc::new(EchoInvoker),
        config.worker_settings(),
    ));
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(LocalDispatcher::new(worker, config.executor_settings()));
    let manager = Arc::new(RunManager::new(
        Arc::clone(&runs) as Arc<dyn RunStore>,
        Arc::clone(&coordination),
        Arc::clone(&admission),
        dispatcher,
        "inst-api".to_string(),
        Duration::from_secs(24 * 60 * 60),
    ));

    let state = AppState {
        manager,
        admission,
        runs: Arc::clone(&runs) as Arc<dyn RunStore>,
        coordination,
        config,
        instance_id: "inst-api".to_string(),
    };

    let protected = runplane::api::build_router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        security::middleware::auth_middleware,
    ));
    let app = Router::new().nest("/api", protected).with_state(state);
    (app, runs)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_start_and_get_run() {
    let (app, runs) = build_app(false);
    runs.insert_thread("t1", "p1", "acct");

    let response = app
        .clone()
        .oneshot(post_json("/api/agent-runs", json!({"thread_id": "t1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/agent-runs/{run_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], json!(run_id));
    assert_eq!(fetched["thread_id"], json!("t1"));
}

#[tokio::test]
async fn test_get_unknown_run_is_404() {
    let (app, _runs) = build_app(false);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/agent-runs/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_twice_returns_conflict() {
    let (app, runs) = build_app(false);
    runs.insert_thread("t1", "p1", "acct");

    let response = app
        .clone()
        .oneshot(post_json("/api/agent-runs", json!({"thread_id": "t1"})))
        .await
        .unwrap();
    let run_id = body_json(response).await["run_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/agent-runs/{run_id}/stop"),
            json!({}),
        ))
        .await
        .unwrap();
    // First stop either cancels the run or conflicts with the in-process
    // worker having finished it already.
    if response.status() == StatusCode::OK {
        let stopped = body_json(response).await;
        assert_eq!(stopped["status"], json!("cancelled"));

        let response = app
            .oneshot(post_json(
                &format!("/api/agent-runs/{run_id}/stop"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error = body_json(response).await;
        assert!(error["error"].as_str().unwrap().contains("already terminal"));
    } else {
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}

#[tokio::test]
async fn test_start_rejected_over_quota_with_details() {
    let (app, runs) = build_app(false);
    runs.insert_thread("t1", "p1", "acct");
    runs.insert_agent("a1", "acct");
    for i in 0..5 {
        let thread = format!("busy-{i}");
        runs.insert_thread(&thread, &format!("bp-{i}"), "acct");
        runs.create_run(runplane::domain::run::NewRun {
            thread_id: thread,
            agent_id: Some("a1".into()),
            agent_version_id: None,
            metadata: json!({}),
        })
        .await
        .unwrap();
    }

    // The principal header is absent (auth off), so the account comes from
    // the thread's ownership chain.
    let response = app
        .oneshot(post_json("/api/agent-runs", json!({"thread_id": "t1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let error = body_json(response).await;
    assert_eq!(error["running_count"], json!(5));
    assert_eq!(error["limit"], json!(5));
}

#[tokio::test]
async fn test_retry_running_run_is_conflict() {
    let (app, runs) = build_app(false);
    runs.insert_thread("t1", "p1", "acct");

    // Seed a run that stays in flight (no dispatch attached).
    let run = runs
        .create_run(runplane::domain::run::NewRun {
            thread_id: "t1".into(),
            agent_id: None,
            agent_version_id: None,
            metadata: json!({}),
        })
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            &format!("/api/agent-runs/{}/retry", run.id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_auth_required_rejects_anonymous() {
    let (app, runs) = build_app(true);
    runs.insert_thread("t1", "p1", "acct");

    let response = app
        .oneshot(post_json("/api/agent-runs", json!({"thread_id": "t1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
