//! In-process job store.
//!
//! Non-durable; used by `STORAGE_BACKEND=memory` and by tests. Conditional
//! updates hold the write lock for the whole check-and-set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::job_store::{JobStore, JobStoreError, StoreResult, DEFAULT_JOB_TTL};
use super::record::{JobPatch, JobRecord, JobStatus};
use crate::common::JobId;

struct StoredJob {
    record: JobRecord,
    expires_at: DateTime<Utc>,
}

impl StoredJob {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, StoredJob>>,
    ttl: chrono::Duration,
    offline: AtomicBool,
    fail_next: AtomicU32,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_JOB_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(48)),
            offline: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make every operation fail with a transient error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` operations with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of stored records, expired ones included.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_faults(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(JobStoreError::Transient("connection refused".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(JobStoreError::Transient("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: JobRecord) -> StoreResult<JobRecord> {
        self.check_faults()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        if jobs.get(&job.job_id).is_some_and(|s| s.is_live(now)) {
            return Err(JobStoreError::AlreadyExists(job.job_id));
        }
        jobs.insert(
            job.job_id.clone(),
            StoredJob {
                record: job.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(job)
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.check_faults()?;
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        Ok(jobs
            .get(job_id)
            .filter(|s| s.is_live(now))
            .map(|s| s.record.clone()))
    }

    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> StoreResult<JobRecord> {
        self.check_faults()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let stored = jobs
            .get_mut(job_id)
            .filter(|s| s.is_live(now))
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
        if stored.record.status.is_terminal() {
            return Err(JobStoreError::Finalized {
                job_id: job_id.clone(),
                status: stored.record.status.clone(),
            });
        }

        stored.record.apply(patch, now);
        stored.expires_at = now + self.ttl;
        Ok(stored.record.clone())
    }

    async fn update_if_status(
        &self,
        job_id: &JobId,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> StoreResult<bool> {
        self.check_faults()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let Some(stored) = jobs.get_mut(job_id).filter(|s| s.is_live(now)) else {
            return Ok(false);
        };
        let status = &stored.record.status;
        if status.is_terminal() || !expected.contains(status) {
            return Ok(false);
        }

        stored.record.apply(patch, now);
        stored.expires_at = now + self.ttl;
        Ok(true)
    }

    async fn find_stale(
        &self,
        statuses: &[JobStatus],
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        self.check_faults()?;
        let now = Utc::now();
        let jobs = self.jobs.read().await;

        let mut stale: Vec<JobRecord> = jobs
            .values()
            .filter(|s| s.is_live(now))
            .map(|s| &s.record)
            .filter(|r| statuses.contains(&r.status) && r.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        self.check_faults()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, s| s.is_live(now));
        Ok((before - jobs.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_faults()
    }
}
