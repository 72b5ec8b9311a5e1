//! PostgreSQL-backed work queue.
//!
//! Items live in `work_items`. Claiming uses `FOR UPDATE SKIP LOCKED` so
//! any number of workers (in any number of processes) can poll the same
//! table without handing one item to two of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;

use super::postgres_store::is_transient;
use super::queue::{
    Backoff, Delivery, DeliveryHandle, EnqueueOptions, FailOutcome, QueueError, QueueInfo,
    QueueResult, QueueSettings, QueueState, StalledItem, WorkItem, WorkQueue,
};
use crate::common::JobId;

#[derive(Debug, FromRow)]
struct DeliveryRow {
    job_id: String,
    url: String,
    attempts: i32,
    max_attempts: i32,
    timeout_ms: i64,
    recovered: bool,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = QueueError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let job_id = JobId::parse(&row.job_id)
            .map_err(|e| QueueError::Backend(format!("corrupt work item: {e}")))?;
        Ok(Delivery {
            item: WorkItem {
                job_id,
                url: row.url,
            },
            attempt: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            timeout_ms: row.timeout_ms.max(0) as u64,
            recovered: row.recovered,
        })
    }
}

#[derive(Debug, FromRow)]
struct FailRow {
    attempts: i32,
    max_attempts: i32,
    backoff_kind: String,
    backoff_ms: i64,
}

#[derive(Debug, FromRow)]
struct StalledRow {
    job_id: String,
    url: String,
    attempts: i32,
    max_attempts: i32,
    timeout_ms: i64,
    exhausted: bool,
}

pub struct PostgresWorkQueue {
    pool: PgPool,
    settings: QueueSettings,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    fn lease_ms(&self) -> f64 {
        self.settings.lease.as_millis() as f64
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn enqueue(&self, item: WorkItem, options: &EnqueueOptions) -> QueueResult<DeliveryHandle> {
        let enqueued_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            INSERT INTO work_items
                (job_id, url, max_attempts, timeout_ms, backoff_kind, backoff_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING enqueued_at
            "#,
        )
        .bind(item.job_id.as_str())
        .bind(&item.url)
        .bind(options.max_attempts as i32)
        .bind(options.timeout_ms as i64)
        .bind(options.backoff.kind())
        .bind(options.backoff.millis() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match enqueued_at {
            Some(enqueued_at) => Ok(DeliveryHandle {
                job_id: item.job_id,
                enqueued_at,
            }),
            None => Err(QueueError::Duplicate(item.job_id)),
        }
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> QueueResult<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            WITH next AS (
                SELECT job_id, recovered
                FROM work_items
                WHERE state = 'waiting' AND run_at <= NOW()
                ORDER BY run_at, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET state = 'active',
                attempts = w.attempts + 1,
                worker_id = $1,
                lease_expires_at = NOW() + make_interval(secs => $3 / 1000.0),
                started_at = NOW(),
                recovered = FALSE
            FROM next
            WHERE w.job_id = next.job_id
            RETURNING w.job_id, w.url, w.attempts, w.max_attempts, w.timeout_ms, next.recovered
            "#,
        )
        .bind(worker_id)
        .bind(limit as i64)
        .bind(self.lease_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if !rows.is_empty() {
            debug!(worker_id = %worker_id, count = rows.len(), "claimed work items");
        }
        rows.into_iter().map(Delivery::try_from).collect()
    }

    async fn heartbeat(&self, job_id: &JobId, worker_id: &str) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET lease_expires_at = NOW() + make_interval(secs => $3 / 1000.0)
            WHERE job_id = $1 AND worker_id = $2 AND state = 'active'
            "#,
        )
        .bind(job_id.as_str())
        .bind(worker_id)
        .bind(self.lease_ms())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, job_id: &JobId, worker_id: &str) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET state = 'completed',
                finished_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL
            WHERE job_id = $1 AND worker_id = $2 AND state = 'active'
            "#,
        )
        .bind(job_id.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job_id.clone()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, FailRow>(
            r#"
            SELECT attempts, max_attempts, backoff_kind, backoff_ms
            FROM work_items
            WHERE job_id = $1 AND worker_id = $2 AND state = 'active'
            FOR UPDATE
            "#,
        )
        .bind(job_id.as_str())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| QueueError::LeaseLost(job_id.clone()))?;

        let attempts = row.attempts.max(0) as u32;
        let outcome = if !retryable {
            FailOutcome::Failed
        } else if attempts >= row.max_attempts.max(0) as u32 {
            FailOutcome::Exhausted
        } else {
            let backoff = Backoff::from_parts(&row.backoff_kind, row.backoff_ms.max(0) as u64);
            let delay = chrono::Duration::from_std(backoff.delay_after(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            FailOutcome::Retrying {
                run_at: Utc::now() + delay,
            }
        };

        match outcome {
            FailOutcome::Retrying { run_at } => {
                sqlx::query(
                    r#"
                    UPDATE work_items
                    SET state = 'waiting',
                        run_at = $2,
                        last_error = $3,
                        worker_id = NULL,
                        lease_expires_at = NULL
                    WHERE job_id = $1
                    "#,
                )
                .bind(job_id.as_str())
                .bind(run_at)
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            }
            FailOutcome::Exhausted | FailOutcome::Failed => {
                sqlx::query(
                    r#"
                    UPDATE work_items
                    SET state = 'failed',
                        finished_at = NOW(),
                        last_error = $2,
                        worker_id = NULL,
                        lease_expires_at = NULL
                    WHERE job_id = $1
                    "#,
                )
                .bind(job_id.as_str())
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn reap_stalled(&self) -> QueueResult<Vec<StalledItem>> {
        let rows = sqlx::query_as::<_, StalledRow>(
            r#"
            WITH stalled AS (
                SELECT job_id, attempts >= max_attempts AS exhausted
                FROM work_items
                WHERE state = 'active' AND lease_expires_at <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET state = CASE WHEN stalled.exhausted THEN 'failed' ELSE 'waiting' END,
                finished_at = CASE WHEN stalled.exhausted THEN NOW() ELSE NULL END,
                run_at = NOW(),
                recovered = NOT stalled.exhausted,
                last_error = 'lease expired without heartbeat',
                worker_id = NULL,
                lease_expires_at = NULL
            FROM stalled
            WHERE w.job_id = stalled.job_id
            RETURNING w.job_id, w.url, w.attempts, w.max_attempts, w.timeout_ms, stalled.exhausted
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let exhausted = row.exhausted;
                let delivery = Delivery::try_from(DeliveryRow {
                    job_id: row.job_id,
                    url: row.url,
                    attempts: row.attempts,
                    max_attempts: row.max_attempts,
                    timeout_ms: row.timeout_ms,
                    recovered: true,
                })?;
                Ok(StalledItem {
                    delivery,
                    exhausted,
                })
            })
            .collect()
    }

    async fn get_info(&self, job_id: &JobId) -> QueueResult<QueueInfo> {
        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            SELECT w.state,
                   CASE WHEN w.state = 'waiting' THEN (
                       SELECT COUNT(*)
                       FROM work_items o
                       WHERE o.state = 'waiting'
                         AND (o.run_at, o.seq) <= (w.run_at, w.seq)
                   ) ELSE 0 END AS position
            FROM work_items w
            WHERE w.job_id = $1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some((raw_state, position)) = row else {
            return Ok(QueueInfo::not_found());
        };
        let state = QueueState::parse(&raw_state)
            .ok_or_else(|| QueueError::Backend(format!("unknown work item state '{raw_state}'")))?;
        Ok(QueueInfo::for_state(state, position, &self.settings))
    }

    async fn remove(&self, job_id: &JobId) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM work_items WHERE job_id = $1")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_finished(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM work_items
            WHERE (state = 'completed' AND finished_at < $1)
               OR (state = 'failed' AND finished_at < $2)
            "#,
        )
        .bind(completed_before)
        .bind(failed_before)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn map_sqlx_error(error: sqlx::Error) -> QueueError {
    if is_transient(&error) {
        QueueError::Unavailable(error.to_string())
    } else {
        QueueError::Backend(error.to_string())
    }
}
