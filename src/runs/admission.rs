//! Admission control: bound concurrent runs per account.
//!
//! Counts `Running` records started within a trailing window, scoped to
//! the account through the agent-ownership chain. Fails open on store
//! errors: product availability is prioritized over precise quota
//! enforcement, and the reaper bounds how stale the count can get.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::store::RunStore;

/// Admission policy knobs.
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// Maximum concurrent runs per account.
    pub max_concurrent_runs: i64,
    /// Trailing window over `started_at`.
    pub window: Duration,
    /// Development/trusted mode: bypass the check entirely.
    pub trusted_mode: bool,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 5,
            window: Duration::from_secs(24 * 60 * 60),
            trusted_mode: false,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunLimitDecision {
    pub can_start: bool,
    pub running_count: i64,
    pub limit: i64,
}

#[derive(Debug)]
pub struct AdmissionController {
    runs: Arc<dyn RunStore>,
    settings: AdmissionSettings,
}

impl AdmissionController {
    pub fn new(runs: Arc<dyn RunStore>, settings: AdmissionSettings) -> Self {
        Self { runs, settings }
    }

    /// Decide whether the account may start another run. Infallible by
    /// contract: a failed count query degrades to a permissive decision.
    pub async fn check_run_limit(&self, account_id: &str) -> RunLimitDecision {
        let limit = self.settings.max_concurrent_runs;
        if self.settings.trusted_mode {
            return RunLimitDecision {
                can_start: true,
                running_count: 0,
                limit,
            };
        }

        let window = chrono::Duration::from_std(self.settings.window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let since = Utc::now() - window;

        match self.runs.running_count_for_account(account_id, since).await {
            Ok(running_count) => RunLimitDecision {
                can_start: running_count < limit,
                running_count,
                limit,
            },
            Err(err) => {
                // Fail open.
                warn!(
                    account_id,
                    error = %err,
                    "run limit check failed, admitting without quota"
                );
                RunLimitDecision {
                    can_start: true,
                    running_count: 0,
                    limit,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::NewRun;
    use crate::error::{ControlError, ControlResult};
    use crate::store::memory::MemoryRunStore;
    use async_trait::async_trait;
    use chrono::DateTime;

    async fn seed_running(store: &MemoryRunStore, agent: &str, count: usize) {
        for _ in 0..count {
            store
                .create_run(NewRun {
                    thread_id: "t1".into(),
                    agent_id: Some(agent.into()),
                    agent_version_id: None,
                    metadata: serde_json::json!({}),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_denies_at_limit() {
        let store = Arc::new(MemoryRunStore::new());
        store.insert_agent("a1", "acct");
        seed_running(&store, "a1", 5).await;

        let controller = AdmissionController::new(store, AdmissionSettings::default());
        let decision = controller.check_run_limit("acct").await;
        assert!(!decision.can_start);
        assert_eq!(decision.running_count, 5);
        assert_eq!(decision.limit, 5);
    }

    #[tokio::test]
    async fn test_admits_below_limit() {
        let store = Arc::new(MemoryRunStore::new());
        store.insert_agent("a1", "acct");
        seed_running(&store, "a1", 4).await;

        let controller = AdmissionController::new(store, AdmissionSettings::default());
        let decision = controller.check_run_limit("acct").await;
        assert!(decision.can_start);
        assert_eq!(decision.running_count, 4);
    }

    #[tokio::test]
    async fn test_trusted_mode_bypasses() {
        let store = Arc::new(MemoryRunStore::new());
        store.insert_agent("a1", "acct");
        seed_running(&store, "a1", 50).await;

        let controller = AdmissionController::new(
            store,
            AdmissionSettings {
                trusted_mode: true,
                ..AdmissionSettings::default()
            },
        );
        assert!(controller.check_run_limit("acct").await.can_start);
    }

    /// Store whose count query always fails.
    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl RunStore for BrokenStore {
        async fn create_run(&self, _: NewRun) -> ControlResult<crate::domain::run::Run> {
            unimplemented!()
        }
        async fn get_run(&self, _: &str) -> ControlResult<Option<crate::domain::run::Run>> {
            unimplemented!()
        }
        async fn mark_processing(&self, _: &str) -> ControlResult<bool> {
            unimplemented!()
        }
        async fn finish_run(
            &self,
            _: &str,
            _: crate::domain::run::RunOutcome,
        ) -> ControlResult<crate::domain::run::Run> {
            unimplemented!()
        }
        async fn inflight_runs_started_before(
            &self,
            _: DateTime<Utc>,
        ) -> ControlResult<Vec<crate::domain::run::Run>> {
            unimplemented!()
        }
        async fn running_count_for_account(
            &self,
            _: &str,
            _: DateTime<Utc>,
        ) -> ControlResult<i64> {
            Err(ControlError::StoreUnavailable("down".into()))
        }
        async fn find_active_run_for_project(
            &self,
            _: &str,
        ) -> ControlResult<Option<crate::domain::run::Run>> {
            unimplemented!()
        }
        async fn get_thread(&self, _: &str) -> ControlResult<Option<crate::store::ThreadRef>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_fails_open_on_store_error() {
        let controller =
            AdmissionController::new(Arc::new(BrokenStore), AdmissionSettings::default());
        let decision = controller.check_run_limit("acct").await;
        assert!(decision.can_start);
        assert_eq!(decision.running_count, 0);
        assert_eq!(decision.limit, 5);
    }
}
