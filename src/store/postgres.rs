//! Postgres-backed run record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{RunStore, ThreadRef};
use crate::domain::run::{NewRun, Run, RunOutcome, RunStatus};
use crate::error::{ControlError, ControlResult};

const RUN_COLUMNS: &str = "id, thread_id, agent_id, agent_version_id, status, started_at, \
                           completed_at, error, metadata, created_at, updated_at";

#[derive(Debug)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        // Run Migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_run(row: &PgRow) -> Result<Run, sqlx::Error> {
    let status_text: String = row.try_get("status")?;
    let status: RunStatus = status_text
        .parse()
        .map_err(|err: String| sqlx::Error::Decode(err.into()))?;
    Ok(Run {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        agent_id: row.try_get("agent_id")?,
        agent_version_id: row.try_get("agent_version_id")?,
        status,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RunStore for PostgresRunStore {
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

        sqlx::query(
            r#"
            INSERT INTO agent_runs
                (id, thread_id, agent_id, agent_version_id, status, started_at,
                 metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&run.id)
        .bind(&run.thread_id)
        .bind(&run.agent_id)
        .bind(&run.agent_version_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(&run.metadata)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> ControlResult<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_processing(&self, run_id: &str) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_runs
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(&self, run_id: &str, outcome: RunOutcome) -> ControlResult<Run> {
        // The status filter is the compare-and-swap: a terminal row never
        // matches, so a losing writer touches nothing.
        let row = sqlx::query(&format!(
            r#"
            UPDATE agent_runs
            SET status = $2,
                error = $3,
                completed_at = NOW(),
                updated_at = NOW(),
                metadata = CASE
                    WHEN $4::jsonb IS NULL THEN metadata
                    ELSE jsonb_set(metadata, '{{output}}', $4::jsonb)
                END
            WHERE id = $1 AND status IN ('pending', 'running', 'processing')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.error)
        .bind(&outcome.output)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(row_to_run(&row)?);
        }

        // Zero rows: the run is missing or another writer finished it first.
        match self.get_run(run_id).await? {
            Some(run) => Err(ControlError::AlreadyTerminal {
                id: run.id,
                status: run.status,
            }),
            None => Err(ControlError::NotFound(run_id.to_string())),
        }
    }

    async fn inflight_runs_started_before(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM agent_runs
            WHERE status IN ('running', 'processing') AND started_at < $1
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(row_to_run(row)?);
        }
        Ok(runs)
    }

    async fn running_count_for_account(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> ControlResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS running
            FROM agent_runs r
            JOIN agents a ON r.agent_id = a.id
            WHERE a.account_id = $1
              AND r.status IN ('running', 'processing')
              AND r.started_at >= $2
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("running")?;
        Ok(count)
    }

    async fn find_active_run_for_project(&self, project_id: &str) -> ControlResult<Option<Run>> {
        let columns = RUN_COLUMNS
            .split(", ")
            .map(|col| format!("r.{col}"))
            .collect::<Vec<_>>()
            .join(", ");
        let row = sqlx::query(&format!(
            r#"
            SELECT {columns}
            FROM agent_runs r
            JOIN threads t ON r.thread_id = t.id
            WHERE t.project_id = $1 AND r.status IN ('running', 'processing')
            ORDER BY r.started_at DESC, r.id DESC
            LIMIT 1
            "#
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_thread(&self, thread_id: &str) -> ControlResult<Option<ThreadRef>> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.project_id, p.account_id
            FROM threads t
            JOIN projects p ON t.project_id = p.id
            WHERE t.id = $1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(ThreadRef {
                id: row.try_get("id")?,
                project_id: row.try_get("project_id")?,
                account_id: row.try_get("account_id")?,
            })),
            None => Ok(None),
        }
    }
}
