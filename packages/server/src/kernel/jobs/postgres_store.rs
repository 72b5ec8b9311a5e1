//! PostgreSQL-backed job store.
//!
//! Records live in `analysis_jobs`. Expiry is an `expires_at` column: reads
//! ignore expired rows and [`JobStore::purge_expired`] deletes them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::warn;

use super::job_store::{JobStore, JobStoreError, StoreResult, DEFAULT_JOB_TTL};
use super::record::{FailureType, JobPatch, JobRecord, JobStatus};
use crate::common::JobId;

const COLUMNS: &str = "job_id, url, status, created_at, updated_at, results, error, error_type, http_status_code";

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    url: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    results: Option<serde_json::Value>,
    error: Option<String>,
    error_type: Option<String>,
    http_status_code: Option<i32>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_id = JobId::parse(&row.job_id)
            .map_err(|e| JobStoreError::Backend(format!("corrupt job row: {e}")))?;
        let error_type = match row.error_type {
            Some(raw) => match raw.parse::<FailureType>() {
                Ok(ty) => Some(ty),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "dropping unreadable error_type");
                    None
                }
            },
            None => None,
        };

        Ok(JobRecord {
            job_id,
            url: row.url,
            status: JobStatus::from(row.status),
            created_at: row.created_at,
            updated_at: row.updated_at,
            results: row.results,
            error: row.error,
            error_type,
            http_status_code: row.http_status_code.and_then(|c| u16::try_from(c).ok()),
        })
    }
}

pub struct PostgresJobStore {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_ttl(pool, DEFAULT_JOB_TTL)
    }

    pub fn with_ttl(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    fn ttl_secs(&self) -> f64 {
        self.ttl.as_secs_f64()
    }
}

fn status_list(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: JobRecord) -> StoreResult<JobRecord> {
        // An expired row with the same id is replaced rather than reported.
        let sql = format!(
            r#"
            INSERT INTO analysis_jobs
                (job_id, url, status, created_at, updated_at, results, error, error_type,
                 http_status_code, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW() + make_interval(secs => $10))
            ON CONFLICT (job_id) DO UPDATE SET
                url = EXCLUDED.url,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                results = EXCLUDED.results,
                error = EXCLUDED.error,
                error_type = EXCLUDED.error_type,
                http_status_code = EXCLUDED.http_status_code,
                expires_at = EXCLUDED.expires_at
            WHERE analysis_jobs.expires_at <= NOW()
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.job_id.as_str())
            .bind(&job.url)
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(&job.results)
            .bind(&job.error)
            .bind(job.error_type.map(|t| t.as_str()))
            .bind(job.http_status_code.map(i32::from))
            .bind(self.ttl_secs())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.try_into(),
            None => Err(JobStoreError::AlreadyExists(job.job_id)),
        }
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM analysis_jobs WHERE job_id = $1 AND expires_at > NOW()"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> StoreResult<JobRecord> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs
            SET status = COALESCE($2, status),
                results = COALESCE($3, results),
                error = COALESCE($4, error),
                error_type = COALESCE($5, error_type),
                http_status_code = COALESCE($6, http_status_code),
                updated_at = NOW(),
                expires_at = NOW() + make_interval(secs => $7)
            WHERE job_id = $1
              AND expires_at > NOW()
              AND status NOT IN ('COMPLETED', 'FAILED')
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_str())
            .bind(patch.status.as_ref().map(|s| s.as_str().to_string()))
            .bind(&patch.results)
            .bind(&patch.error)
            .bind(patch.error_type.map(|t| t.as_str()))
            .bind(patch.http_status_code.map(i32::from))
            .bind(self.ttl_secs())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(row) = row {
            return row.try_into();
        }

        // Nothing matched: tell missing apart from finalized.
        match self.get(job_id).await? {
            Some(existing) => Err(JobStoreError::Finalized {
                job_id: job_id.clone(),
                status: existing.status,
            }),
            None => Err(JobStoreError::NotFound(job_id.clone())),
        }
    }

    async fn update_if_status(
        &self,
        job_id: &JobId,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = COALESCE($2, status),
                results = COALESCE($3, results),
                error = COALESCE($4, error),
                error_type = COALESCE($5, error_type),
                http_status_code = COALESCE($6, http_status_code),
                updated_at = NOW(),
                expires_at = NOW() + make_interval(secs => $7)
            WHERE job_id = $1
              AND expires_at > NOW()
              AND status = ANY($8)
              AND status NOT IN ('COMPLETED', 'FAILED')
            "#,
        )
        .bind(job_id.as_str())
        .bind(patch.status.as_ref().map(|s| s.as_str().to_string()))
        .bind(&patch.results)
        .bind(&patch.error)
        .bind(patch.error_type.map(|t| t.as_str()))
        .bind(patch.http_status_code.map(i32::from))
        .bind(self.ttl_secs())
        .bind(status_list(expected))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM analysis_jobs
            WHERE status = ANY($1)
              AND created_at < $2
              AND expires_at > NOW()
            ORDER BY created_at ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status_list(statuses))
            .bind(created_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM analysis_jobs WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Whether a sqlx failure is worth retrying.
pub(crate) fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected, admin_shutdown
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001" | "40P01" | "57P01"))
        }
        _ => false,
    }
}

fn map_sqlx_error(error: sqlx::Error) -> JobStoreError {
    if is_transient(&error) {
        JobStoreError::Transient(error.to_string())
    } else {
        JobStoreError::Backend(error.to_string())
    }
}
