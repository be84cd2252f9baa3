//! End-to-end tests over the in-memory backends: start/stop/retry flows,
//! instance cleanup, and cross-instance presence-key discipline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use runplane::coordination::{CoordinationStore, MemoryStore, keys};
use runplane::domain::run::{Run, RunStatus};
use runplane::error::{ControlError, ControlResult};
use runplane::executor::worker::{AgentInvoker, RunWorker, StepLog, WorkerSettings};
use runplane::executor::{ExecuteRun, ExecutorSettings, LocalDispatcher};
use runplane::runs::admission::{AdmissionController, AdmissionSettings};
use runplane::runs::manager::{RunManager, StartRun};
use runplane::store::{MemoryRunStore, RunStore};

/// Invoker that blocks until the test opens the gate, then echoes params.
#[derive(Debug)]
struct GatedInvoker {
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl AgentInvoker for GatedInvoker {
    async fn invoke(&self, job: &ExecuteRun, steps: &StepLog) -> ControlResult<serde_json::Value> {
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                return Err(ControlError::Worker("gate dropped".into()));
            }
        }
        steps.record("work");
        Ok(job.params.clone())
    }
}

struct TestPlane {
    runs: Arc<MemoryRunStore>,
    coordination: Arc<MemoryStore>,
    manager: Arc<RunManager>,
    worker: Arc<RunWorker>,
    gate: watch::Sender<bool>,
}

fn plane(instance_id: &str) -> TestPlane {
    let runs = Arc::new(MemoryRunStore::new());
    let coordination = Arc::new(MemoryStore::new());
    let (gate, gate_rx) = watch::channel(false);

    let worker = Arc::new(RunWorker::new(
        Arc::clone(&runs) as Arc<dyn RunStore>,
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
        Arc::new(GatedInvoker { gate: gate_rx }),
        WorkerSettings::default(),
    ));
    let dispatcher = Arc::new(LocalDispatcher::new(
        Arc::clone(&worker),
        ExecutorSettings {
            max_retries: 0,
            hard_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(10),
        },
    ));
    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&runs) as Arc<dyn RunStore>,
        AdmissionSettings::default(),
    ));
    let manager = Arc::new(RunManager::new(
        Arc::clone(&runs) as Arc<dyn RunStore>,
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
        admission,
        dispatcher,
        instance_id.to_string(),
        Duration::from_secs(24 * 60 * 60),
    ));

    TestPlane {
        runs,
        coordination,
        manager,
        worker,
        gate,
    }
}

fn start_request(thread_id: &str) -> StartRun {
    StartRun {
        thread_id: thread_id.to_string(),
        agent_id: None,
        agent_version_id: None,
        params: json!({"prompt": "do the thing"}),
        account_id: None,
        metadata: json!({}),
    }
}

async fn wait_for_status(runs: &MemoryRunStore, run_id: &str, status: RunStatus) -> Run {
    for _ in 0..500 {
        if let Some(run) = runs.get_run(run_id).await.unwrap() {
            if run.status == status {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached {status:?}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario A: a fresh run is discoverable as the project's active run
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_started_run_is_projects_active_run() {
    let plane = plane("inst-a");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let active = plane
        .manager
        .find_active_run_for_project("p1")
        .await
        .unwrap()
        .expect("project should have an active run");
    assert_eq!(active.id, run.id);

    // The presence key is in place while the run is live.
    assert!(
        plane
            .coordination
            .exists(&keys::presence_key("inst-a", &run.id))
            .await
            .unwrap()
    );

    // Release the worker and let the run complete.
    plane.gate.send(true).unwrap();
    let done = wait_for_status(&plane.runs, &run.id, RunStatus::Completed).await;
    assert!(done.completed_at.is_some());
    assert_eq!(done.metadata["output"]["result"], json!({"prompt": "do the thing"}));

    // Completion clears both discovery signals.
    assert!(
        plane
            .manager
            .find_active_run_for_project("p1")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        plane
            .coordination
            .scan(&keys::run_presence_pattern(&run.id))
            .await
            .unwrap()
            .is_empty()
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario B: double stop, first cancels, second sees AlreadyTerminal
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_double_stop() {
    let plane = plane("inst-b");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();

    let stopped = plane.manager.stop_run(&run.id, None).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Cancelled);
    assert!(stopped.completed_at.is_some());
    assert!(stopped.error.is_none());

    let err = plane.manager.stop_run(&run.id, None).await.unwrap_err();
    match err {
        ControlError::AlreadyTerminal { id, status } => {
            assert_eq!(id, run.id);
            assert_eq!(status, RunStatus::Cancelled);
        }
        other => panic!("expected AlreadyTerminal, got {other:?}"),
    }

    // The second call never mutates the record.
    let after = plane.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(after.updated_at, stopped.updated_at);
}

#[tokio::test]
async fn test_stop_with_reason_fails_the_run() {
    let plane = plane("inst-b2");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    let stopped = plane
        .manager
        .stop_run(&run.id, Some("operator abort"))
        .await
        .unwrap();
    assert_eq!(stopped.status, RunStatus::Failed);
    assert_eq!(stopped.error.as_deref(), Some("operator abort"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario C: duplicate delivery against a finished run is a no-op
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_dispatch_leaves_completed_run_unchanged() {
    let plane = plane("inst-c");
    plane.runs.insert_thread("t1", "p1", "acct");
    plane.gate.send(true).unwrap();

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    let done = wait_for_status(&plane.runs, &run.id, RunStatus::Completed).await;

    // Redeliver the same task directly to the worker.
    plane
        .worker
        .execute(&ExecuteRun {
            run_id: run.id.clone(),
            thread_id: "t1".into(),
            instance_id: "inst-c".into(),
            params: json!({}),
        })
        .await
        .unwrap();

    let after = plane.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Completed);
    assert_eq!(after.updated_at, done.updated_at);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario D: instance cleanup stops everything the instance holds
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_instance_cleanup_stops_held_runs() {
    let plane = plane("inst-d");
    plane.runs.insert_thread("t1", "p1", "acct");
    plane.runs.insert_thread("t2", "p2", "acct");

    let r1 = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    let r2 = plane
        .manager
        .start_run(start_request("t2"))
        .await
        .unwrap();

    let stopped = plane.manager.cleanup_instance_runs("inst-d").await;
    assert_eq!(stopped, 2);

    for run_id in [&r1.id, &r2.id] {
        let run = plane.runs.get_run(run_id).await.unwrap().unwrap();
        assert!(run.is_terminal());
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("instance shutting down"));
    }

    assert!(
        plane
            .coordination
            .scan(&keys::instance_presence_pattern("inst-d"))
            .await
            .unwrap()
            .is_empty()
    );

    // Idempotent: nothing left to stop.
    assert_eq!(plane.manager.cleanup_instance_runs("inst-d").await, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Stop protocol details
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_clears_presence_keys_across_instances() {
    let plane = plane("inst-e");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();

    // Another instance is also polling this run.
    plane
        .coordination
        .set(
            &keys::presence_key("inst-other", &run.id),
            "running",
            None,
            false,
        )
        .await
        .unwrap();
    // It listens on its per-instance control topic.
    let mut other_stop = plane
        .coordination
        .subscribe(&keys::instance_control_topic(&run.id, "inst-other"))
        .await
        .unwrap();

    plane.manager.stop_run(&run.id, None).await.unwrap();

    // Every instance's presence key for the run is gone.
    assert!(
        plane
            .coordination
            .scan(&keys::run_presence_pattern(&run.id))
            .await
            .unwrap()
            .is_empty()
    );
    // The other instance received its targeted STOP.
    assert_eq!(other_stop.recv().await.as_deref(), Some("STOP"));
    // The response buffer is gone too.
    assert!(
        !plane
            .coordination
            .exists(&keys::response_key(&run.id))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_stop_missing_run_is_not_found() {
    let plane = plane("inst-f");
    let err = plane.manager.stop_run("ghost", None).await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission and project exclusivity on the start path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_rejected_at_quota() {
    let plane = plane("inst-g");
    plane.runs.insert_thread("t1", "p1", "acct");
    plane.runs.insert_agent("a1", "acct");

    // Five runs already in flight for the account.
    for i in 0..5 {
        let thread = format!("busy-{i}");
        plane.runs.insert_thread(&thread, &format!("bp-{i}"), "acct");
        plane
            .runs
            .create_run(runplane::domain::run::NewRun {
                thread_id: thread,
                agent_id: Some("a1".into()),
                agent_version_id: None,
                metadata: json!({}),
            })
            .await
            .unwrap();
    }

    let mut request = start_request("t1");
    request.account_id = Some("acct".into());
    let err = plane.manager.start_run(request).await.unwrap_err();
    match err {
        ControlError::QuotaExceeded {
            running_count,
            limit,
        } => {
            assert_eq!(running_count, 5);
            assert_eq!(limit, 5);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_start_rejected_while_project_busy() {
    let plane = plane("inst-h");
    plane.runs.insert_thread("t1", "p1", "acct");
    plane.runs.insert_thread("t2", "p1", "acct");

    plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    let err = plane
        .manager
        .start_run(start_request("t2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ProjectBusy(project) if project == "p1"));
}

#[tokio::test]
async fn test_start_unknown_thread_is_not_found() {
    let plane = plane("inst-i");
    let err = plane
        .manager
        .start_run(start_request("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_creates_linked_run() {
    let plane = plane("inst-j");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    plane
        .manager
        .stop_run(&run.id, Some("flaky model"))
        .await
        .unwrap();

    plane.gate.send(true).unwrap();
    let retried = plane.manager.retry_run(&run.id, None).await.unwrap();
    assert_ne!(retried.id, run.id);
    assert_eq!(retried.metadata["retry_of"], json!(run.id));
    // Configuration (params) carries over.
    assert_eq!(
        retried.metadata["params"],
        json!({"prompt": "do the thing"})
    );

    let done = wait_for_status(&plane.runs, &retried.id, RunStatus::Completed).await;
    assert!(done.completed_at.is_some());

    // The source run is untouched by the retry.
    let source = plane.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(source.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_retry_rejected_for_non_terminal_and_completed_runs() {
    let plane = plane("inst-k");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();
    // Still running: not retryable.
    let err = plane.manager.retry_run(&run.id, None).await.unwrap_err();
    assert!(matches!(err, ControlError::NotRetryable { .. }));

    plane.gate.send(true).unwrap();
    wait_for_status(&plane.runs, &run.id, RunStatus::Completed).await;
    // Completed: nothing to retry either.
    let err = plane.manager.retry_run(&run.id, None).await.unwrap_err();
    assert!(matches!(err, ControlError::NotRetryable { .. }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Cooperative cancellation through the control topic
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_cancels_inflight_worker() {
    let plane = plane("inst-l");
    plane.runs.insert_thread("t1", "p1", "acct");

    let run = plane
        .manager
        .start_run(start_request("t1"))
        .await
        .unwrap();

    // Give the worker time to subscribe, then stop without ever opening
    // the gate: only the STOP broadcast can end the invocation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stopped = plane.manager.stop_run(&run.id, None).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Cancelled);

    // The worker observes the signal and exits; its terminal write loses
    // to the stop and the record stays Cancelled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = plane.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(
        plane
            .coordination
            .scan(&keys::run_presence_pattern(&run.id))
            .await
            .unwrap()
            .is_empty()
    );
}
