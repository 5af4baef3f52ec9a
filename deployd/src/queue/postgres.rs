//! PostgreSQL task queue
//!
//! Claiming uses a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED)` statement, so concurrent dispatchers (in this process or in other
//! processes) skip rows another claimant already holds instead of blocking on
//! them. A partial unique index on `target_name WHERE status = 'claimed'`
//! backs the one-claim-per-target predicate when two claimants race on
//! different rows of the same target.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::models::{new_task_id, DeploymentTask, LiveTarget, NewTask, TaskId, TaskStatus};
use crate::queue::validate::validate_task;
use crate::queue::{check_finalize, TaskQueue};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS deployment_tasks (
        id UUID PRIMARY KEY,
        app_id TEXT NOT NULL,
        target_name TEXT NOT NULL,
        repo_url TEXT NOT NULL,
        branch TEXT NOT NULL,
        build_command TEXT NOT NULL,
        target_port INTEGER NOT NULL,
        encrypted_credentials TEXT,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'claimed', 'success', 'failed', 'cancelled')),
        log TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS deployment_tasks_pending_idx
        ON deployment_tasks (created_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS deployment_tasks_one_claim_per_target
        ON deployment_tasks (target_name)
        WHERE status = 'claimed'
    "#,
];

const CLAIM_NEXT: &str = r#"
    UPDATE deployment_tasks
    SET status = 'claimed', started_at = now()
    WHERE id = (
        SELECT t.id FROM deployment_tasks t
        WHERE t.status = 'pending'
          AND NOT EXISTS (
            SELECT 1 FROM deployment_tasks c
            WHERE c.target_name = t.target_name
              AND c.status = 'claimed'
          )
        ORDER BY t.created_at, t.id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    AND status = 'pending'
    RETURNING *
"#;

#[derive(Debug, FromRow)]
struct TaskRow {
    id: uuid::Uuid,
    app_id: String,
    target_name: String,
    repo_url: String,
    branch: String,
    build_command: String,
    target_port: i32,
    encrypted_credentials: Option<String>,
    status: String,
    log: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for DeploymentTask {
    type Error = DeployError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let target_port = u16::try_from(row.target_port).map_err(|_| {
            DeployError::Internal(format!("Task {} has invalid port {}", row.id, row.target_port))
        })?;
        Ok(DeploymentTask {
            id: row.id,
            app_id: row.app_id,
            target_name: row.target_name,
            repo_url: row.repo_url,
            branch: row.branch,
            build_command: row.build_command,
            target_port,
            encrypted_credentials: row.encrypted_credentials,
            status: row.status.parse()?,
            log: row.log,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

/// Postgres-backed queue
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    /// Connect and make sure the schema exists
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DeployError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let queue = Self::from_pool(pool);
        queue.migrate().await?;
        Ok(queue)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if missing
    pub async fn migrate(&self) -> Result<(), DeployError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Task queue schema ready");
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, DeployError> {
        validate_task(&task)?;

        let id = new_task_id();
        sqlx::query(
            r#"
            INSERT INTO deployment_tasks
                (id, app_id, target_name, repo_url, branch, build_command, target_port, encrypted_credentials)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(&task.app_id)
        .bind(&task.target_name)
        .bind(&task.repo_url)
        .bind(&task.branch)
        .bind(&task.build_command)
        .bind(i32::from(task.target_port))
        .bind(&task.encrypted_credentials)
        .execute(&self.pool)
        .await?;

        debug!("Enqueued task {}", id);
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<DeploymentTask>, DeployError> {
        let row = sqlx::query_as::<_, TaskRow>(CLAIM_NEXT)
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => Ok(Some(row.try_into()?)),
            Ok(None) => Ok(None),
            // Another claimant took a task for the same target between our
            // predicate check and our update. Nothing claimable for us now.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!("Claim lost a same-target race, retrying next poll");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append_log(&self, id: TaskId, chunk: &str) -> Result<(), DeployError> {
        let result = sqlx::query("UPDATE deployment_tasks SET log = log || $2 WHERE id = $1")
            .bind(id)
            .bind(chunk)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    async fn finalize(&self, id: TaskId, status: TaskStatus) -> Result<(), DeployError> {
        let sources: Vec<String> = status
            .sources()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        if status.is_terminal() {
            let updated = sqlx::query(
                r#"
                UPDATE deployment_tasks
                SET status = $2, finished_at = now()
                WHERE id = $1 AND status = ANY($3)
                "#,
            )
            .bind(id)
            .bind(status.as_str())
            .bind(&sources)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return Ok(());
            }
        }

        // Nothing updated: either an idempotent repeat or an illegal transition
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM deployment_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let current: TaskStatus = current
            .ok_or_else(|| DeployError::NotFound(format!("task {}", id)))?
            .parse()?;

        match check_finalize(id, current, status)? {
            false => Ok(()),
            true => Err(DeployError::StateError(format!(
                "Task {}: concurrent transition from {}",
                id, current
            ))),
        }
    }

    async fn cancel_pending(&self, id: TaskId) -> Result<bool, DeployError> {
        let updated = sqlx::query(
            r#"
            UPDATE deployment_tasks
            SET status = 'cancelled', finished_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            debug!("Cancelled pending task {}", id);
            return Ok(true);
        }

        let exists: Option<String> =
            sqlx::query_scalar("SELECT status FROM deployment_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(DeployError::NotFound(format!("task {}", id))),
        }
    }

    async fn fail_stale_claims(
        &self,
        older_than: Duration,
        marker: &str,
    ) -> Result<Vec<TaskId>, DeployError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE deployment_tasks
            SET status = 'failed', finished_at = now(), log = log || $2
            WHERE status = 'claimed'
              AND (started_at IS NULL OR started_at < now() - make_interval(secs => $1))
            RETURNING id
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(marker)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get(&self, id: TaskId) -> Result<Option<DeploymentTask>, DeployError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM deployment_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DeploymentTask::try_from).transpose()
    }

    async fn live_targets(&self) -> Result<Vec<LiveTarget>, DeployError> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (target_name) target_name, target_port
            FROM deployment_tasks
            WHERE status = 'success'
            ORDER BY target_name, finished_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(target_name, port)| {
                u16::try_from(port).ok().map(|target_port| LiveTarget {
                    target_name,
                    target_port,
                })
            })
            .collect())
    }
}
