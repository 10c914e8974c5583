//! Task queue repository implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use uuid::Uuid;

use linkage_core::{
    defaults, new_v7, Error, Result, Task, TaskArgs, TaskKind, TaskQueue, TaskStatus,
};

const TASK_COLUMNS: &str = "id, task_kind, args, status, error_message, retry_count, \
     max_retries, created_at, started_at, completed_at";

/// PostgreSQL implementation of TaskQueue.
pub struct PgTaskQueue {
    pool: Pool<Postgres>,
    /// Wakes idle workers when a task is enqueued.
    notify: Arc<Notify>,
    max_retries: i32,
}

impl PgTaskQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            max_retries: defaults::TASK_MAX_RETRIES,
        }
    }

    /// Override the retry budget of newly enqueued tasks.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Notification handle signalled on every enqueue.
    pub fn task_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_task_row(row: sqlx::postgres::PgRow) -> Result<Task> {
        let args: serde_json::Value = row.get("args");
        let status: String = row.get("status");
        Ok(Task {
            id: row.get("id"),
            args: serde_json::from_value::<TaskArgs>(args)?,
            status: TaskStatus::parse(&status),
            error_message: row.get("error_message"),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, args: TaskArgs) -> Result<Uuid> {
        let task_id = new_v7();
        sqlx::query(
            "INSERT INTO task_queue (id, task_kind, graph_id, args, status, max_retries, created_at)
             VALUES ($1, $2, $3, $4, 'pending', $5, $6)",
        )
        .bind(task_id)
        .bind(args.kind().as_str())
        .bind(args.graph_id())
        .bind(serde_json::to_value(&args)?)
        .bind(self.max_retries)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.notify.notify_waiters();
        Ok(task_id)
    }

    async fn claim_next_for_kinds(&self, kinds: &[TaskKind]) -> Result<Option<Task>> {
        let kind_strings: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();

        // Empty array = claim any kind.
        let row = sqlx::query(&format!(
            "UPDATE task_queue
             SET status = 'running', started_at = $1
             WHERE id = (
                 SELECT id FROM task_queue
                 WHERE status = 'pending'
                   AND (cardinality($2::text[]) = 0 OR task_kind = ANY($2))
                 ORDER BY created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(&kind_strings)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE task_queue SET status = 'completed', completed_at = $1, error_message = NULL
             WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (retry_count, max_retries): (i32, i32) = sqlx::query_as(
            "SELECT retry_count, max_retries FROM task_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let requeued = retry_count < max_retries;
        if requeued {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'pending', retry_count = $1, error_message = $2, started_at = NULL
                 WHERE id = $3",
            )
            .bind(retry_count + 1)
            .bind(error)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        } else {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'failed', completed_at = $1, error_message = $2
                 WHERE id = $3",
            )
            .bind(Utc::now())
            .bind(error)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM task_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count.0)
    }
}
