use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{types::Json, Executor, Pool, Postgres, Row};
use uuid::Uuid;

use super::{EnqueueResult, Task, TaskEnvelope, TaskQueue};
use crate::error::Error;

/// Task queue backed by the `scheduled_tasks` table.
pub struct PgTaskQueue {
    pool: Pool<Postgres>,
}

impl PgTaskQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    #[tracing::instrument(skip(self))]
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<EnqueueResult, Error> {
        let now = Utc::now();
        let envelope = TaskEnvelope::new(task, now + delay, now);
        let key = envelope.task.dedup_key();

        let mut conn = self.pool.acquire().await?;

        let inserted = conn
            .execute(
                sqlx::query(
                    "INSERT INTO scheduled_tasks (id, dedup_key, kind, payload, attempt, run_at, enqueued_at)
                     VALUES ($1, $2, $3, $4, 0, $5, $6)
                     ON CONFLICT (dedup_key) DO NOTHING",
                )
                .bind(&envelope.id)
                .bind(&key)
                .bind(envelope.task.name())
                .bind(Json(&envelope.task))
                .bind(envelope.run_at)
                .bind(envelope.enqueued_at),
            )
            .await?
            .rows_affected();

        if inserted == 1 {
            return Ok(EnqueueResult::Enqueued { id: envelope.id });
        }

        let existing_id: Uuid = conn
            .fetch_one(sqlx::query("SELECT id FROM scheduled_tasks WHERE dedup_key = $1").bind(&key))
            .await?
            .try_get("id")?;

        Ok(EnqueueResult::Deduplicated { existing_id })
    }

    #[tracing::instrument(skip(self))]
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize, lease: Duration) -> Result<Vec<TaskEnvelope>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "UPDATE scheduled_tasks SET attempt = attempt + 1, leased_until = $2
                     WHERE id IN (
                        SELECT id FROM scheduled_tasks
                        WHERE run_at <= $1 AND (leased_until IS NULL OR leased_until <= $1)
                        ORDER BY run_at ASC
                        LIMIT $3
                        FOR UPDATE SKIP LOCKED
                     )
                     RETURNING id, payload, attempt, run_at, enqueued_at",
                )
                .bind(now)
                .bind(now + lease)
                .bind(limit as i64),
            )
            .await?;

        let mut envelopes = Vec::with_capacity(rows.len());

        for row in rows.iter() {
            let Json(task): Json<Task> = row.try_get("payload")?;
            let attempt: i32 = row.try_get("attempt")?;

            envelopes.push(TaskEnvelope {
                id: row.try_get("id")?,
                task,
                attempt: attempt.max(0) as u32,
                run_at: row.try_get("run_at")?,
                enqueued_at: row.try_get("enqueued_at")?,
            });
        }

        envelopes.sort_by_key(|envelope| envelope.run_at);

        Ok(envelopes)
    }

    #[tracing::instrument(skip(self))]
    async fn complete(&self, id: Uuid) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1").bind(&id))
            .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn reschedule(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query(
                "UPDATE scheduled_tasks SET run_at = $2, leased_until = NULL, last_error = $3 WHERE id = $1",
            )
            .bind(&id)
            .bind(Utc::now() + delay)
            .bind(error),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1").bind(&id))
            .await?;

        tracing::warn!(%id, %error, "task abandoned");

        Ok(())
    }

    async fn depth(&self) -> Result<usize, Error> {
        let mut conn = self.pool.acquire().await?;

        let depth: i64 = conn
            .fetch_one(sqlx::query("SELECT COUNT(*) AS depth FROM scheduled_tasks"))
            .await?
            .try_get("depth")?;

        Ok(depth.max(0) as usize)
    }
}
