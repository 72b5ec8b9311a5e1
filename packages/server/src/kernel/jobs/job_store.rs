//! Job record persistence.
//!
//! [`JobStore`] is the durable source of truth for job state. Backends only
//! have to provide the raw operations; [`RetryingJobStore`] layers the
//! transient-error retry policy on top of any of them.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use super::record::{JobPatch, JobRecord, JobStatus};
use crate::common::JobId;

/// How long a record lives after its last write.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStoreError {
    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    /// Terminal records are immutable.
    #[error("job {job_id} is already {status} and cannot be modified")]
    Finalized { job_id: JobId, status: JobStatus },

    /// Worth retrying (connection dropped, pool exhausted, ...)
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("storage error: {0}")]
    Backend(String),
}

impl JobStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Transient(_))
    }

    /// The backend could not serve the request at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            JobStoreError::Transient(_) | JobStoreError::Unavailable { .. } | JobStoreError::Backend(_)
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, JobStoreError>;

/// Key-value persistence for job records with TTL expiry.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, job: JobRecord) -> StoreResult<JobRecord>;

    /// Fetch a live (unexpired) record.
    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;

    /// Merge `patch` into an existing non-terminal record and refresh its TTL.
    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> StoreResult<JobRecord>;

    /// Apply `patch` only if the current status is one of `expected`, as a
    /// single conditional operation. Returns whether the update took effect.
    async fn update_if_status(
        &self,
        job_id: &JobId,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> StoreResult<bool>;

    /// Claim guard: apply `patch` only while the job is still PENDING.
    async fn update_if_pending(&self, job_id: &JobId, patch: &JobPatch) -> StoreResult<bool> {
        self.update_if_status(job_id, &[JobStatus::Pending], patch)
            .await
    }

    /// Records in one of `statuses` created before `created_before`, oldest first.
    async fn find_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>>;

    /// Delete records past their TTL. Returns the number removed.
    async fn purge_expired(&self) -> StoreResult<u64>;

    /// Cheap reachability check.
    async fn ping(&self) -> StoreResult<()>;
}

/// Retries transient backend errors with exponential backoff.
///
/// Defaults to three retries after 100ms, 200ms and 400ms; the last
/// transient error surfaces as [`JobStoreError::Unavailable`].
pub struct RetryingJobStore<S> {
    inner: S,
    delays: Vec<Duration>,
}

impl<S: JobStore> RetryingJobStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            delays: vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ],
        }
    }

    /// Override the backoff schedule (one entry per retry).
    pub fn with_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = delays;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(e) if e.is_transient() => {
                    self.back_off(op, attempt, &e).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Sleep before retry number `attempt + 1`, or give up.
    async fn back_off(&self, op: &'static str, attempt: usize, error: &JobStoreError) -> StoreResult<()> {
        let Some(delay) = self.delays.get(attempt).copied() else {
            return Err(JobStoreError::Unavailable {
                attempts: attempt as u32 + 1,
                message: error.to_string(),
            });
        };
        warn!(
            operation = op,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "job store operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[async_trait]
impl<S: JobStore> JobStore for RetryingJobStore<S> {
    async fn create(&self, job: JobRecord) -> StoreResult<JobRecord> {
        let mut attempt = 0;
        loop {
            match self.inner.create(job.clone()).await {
                // An earlier attempt may have landed before its reply was lost.
                Err(JobStoreError::AlreadyExists(job_id)) if attempt > 0 => {
                    return match self.inner.get(&job_id).await? {
                        Some(existing)
                            if existing.url == job.url && existing.status == JobStatus::Pending =>
                        {
                            Ok(existing)
                        }
                        _ => Err(JobStoreError::AlreadyExists(job_id)),
                    };
                }
                Err(e) if e.is_transient() => {
                    self.back_off("create", attempt, &e).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.retry("get", || self.inner.get(job_id)).await
    }

    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> StoreResult<JobRecord> {
        self.retry("update", || self.inner.update(job_id, patch))
            .await
    }

    async fn update_if_status(
        &self,
        job_id: &JobId,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> StoreResult<bool> {
        self.retry("update_if_status", || {
            self.inner.update_if_status(job_id, expected, patch)
        })
        .await
    }

    async fn find_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        self.retry("find_stale", || {
            self.inner.find_stale(statuses, created_before, limit)
        })
        .await
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.retry("purge_expired", || self.inner.purge_expired())
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}
