//! In-process work queue.
//!
//! Same state machine as the Postgres queue, kept in a single mutex-guarded
//! map. Not durable across restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::queue::{
    Delivery, DeliveryHandle, EnqueueOptions, FailOutcome, QueueError, QueueInfo, QueueResult,
    QueueSettings, QueueState, StalledItem, WorkItem, WorkQueue,
};
use crate::common::JobId;

#[derive(Debug)]
struct Entry {
    item: WorkItem,
    options: EnqueueOptions,
    state: QueueState,
    seq: u64,
    attempts: u32,
    run_at: DateTime<Utc>,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    recovered: bool,
    last_error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn delivery(&self, recovered: bool) -> Delivery {
        Delivery {
            item: self.item.clone(),
            attempt: self.attempts,
            max_attempts: self.options.max_attempts,
            timeout_ms: self.options.timeout_ms,
            recovered,
        }
    }

    fn held_by(&self, worker_id: &str) -> bool {
        self.state == QueueState::Active && self.worker_id.as_deref() == Some(worker_id)
    }

    fn finish(&mut self, state: QueueState, now: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(now);
        self.worker_id = None;
        self.lease_expires_at = None;
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl Inner {
    /// Waiting items in delivery order.
    fn wait_line(&self) -> Vec<(&JobId, &Entry)> {
        let mut waiting: Vec<_> = self
            .items
            .iter()
            .filter(|(_, e)| e.state == QueueState::Waiting)
            .collect();
        waiting.sort_by_key(|(_, e)| (e.run_at, e.seq));
        waiting
    }
}

pub struct MemoryWorkQueue {
    inner: Mutex<Inner>,
    settings: QueueSettings,
    offline: AtomicBool,
    fail_next: AtomicU32,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl MemoryWorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings,
            offline: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Reject every operation until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject the next `n` operations.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of items in any state.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Last recorded failure message for an item.
    pub async fn last_error(&self, job_id: &JobId) -> Option<String> {
        self.inner
            .lock()
            .await
            .items
            .get(job_id)
            .and_then(|e| e.last_error.clone())
    }

    fn check_faults(&self) -> QueueResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("connection refused".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(QueueError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, item: WorkItem, options: &EnqueueOptions) -> QueueResult<DeliveryHandle> {
        self.check_faults()?;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        if inner.items.contains_key(&item.job_id) {
            return Err(QueueError::Duplicate(item.job_id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let job_id = item.job_id.clone();
        inner.items.insert(
            job_id.clone(),
            Entry {
                item,
                options: *options,
                state: QueueState::Waiting,
                seq,
                attempts: 0,
                run_at: now,
                worker_id: None,
                lease_expires_at: None,
                recovered: false,
                last_error: None,
                finished_at: None,
            },
        );

        Ok(DeliveryHandle {
            job_id,
            enqueued_at: now,
        })
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> QueueResult<Vec<Delivery>> {
        self.check_faults()?;
        let now = Utc::now();
        let lease = chrono_duration(self.settings.lease);
        let mut inner = self.inner.lock().await;

        let ready: Vec<JobId> = inner
            .wait_line()
            .into_iter()
            .filter(|(_, e)| e.run_at <= now)
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();

        let mut deliveries = Vec::with_capacity(ready.len());
        for job_id in ready {
            if let Some(entry) = inner.items.get_mut(&job_id) {
                let recovered = std::mem::take(&mut entry.recovered);
                entry.state = QueueState::Active;
                entry.attempts += 1;
                entry.worker_id = Some(worker_id.to_string());
                entry.lease_expires_at = Some(now + lease);
                deliveries.push(entry.delivery(recovered));
            }
        }
        Ok(deliveries)
    }

    async fn heartbeat(&self, job_id: &JobId, worker_id: &str) -> QueueResult<bool> {
        self.check_faults()?;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match inner.items.get_mut(job_id) {
            Some(entry) if entry.held_by(worker_id) => {
                entry.lease_expires_at = Some(now + chrono_duration(self.settings.lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job_id: &JobId, worker_id: &str) -> QueueResult<()> {
        self.check_faults()?;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match inner.items.get_mut(job_id) {
            Some(entry) if entry.held_by(worker_id) => {
                entry.finish(QueueState::Completed, now);
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(job_id.clone())),
        }
    }

    async fn fail(
        &self,
        job_id: &JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        self.check_faults()?;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let entry = match inner.items.get_mut(job_id) {
            Some(entry) if entry.held_by(worker_id) => entry,
            _ => return Err(QueueError::LeaseLost(job_id.clone())),
        };

        entry.last_error = Some(error.to_string());
        if !retryable {
            entry.finish(QueueState::Failed, now);
            return Ok(FailOutcome::Failed);
        }
        if entry.attempts >= entry.options.max_attempts {
            entry.finish(QueueState::Failed, now);
            return Ok(FailOutcome::Exhausted);
        }

        let run_at = now + chrono_duration(entry.options.backoff.delay_after(entry.attempts));
        entry.state = QueueState::Waiting;
        entry.run_at = run_at;
        entry.worker_id = None;
        entry.lease_expires_at = None;
        Ok(FailOutcome::Retrying { run_at })
    }

    async fn reap_stalled(&self) -> QueueResult<Vec<StalledItem>> {
        self.check_faults()?;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let mut stalled = Vec::new();
        for entry in inner.items.values_mut() {
            let expired = entry.state == QueueState::Active
                && entry.lease_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }

            let delivery = entry.delivery(true);
            let exhausted = entry.attempts >= entry.options.max_attempts;
            entry.last_error = Some("lease expired without heartbeat".to_string());
            if exhausted {
                entry.finish(QueueState::Failed, now);
            } else {
                entry.state = QueueState::Waiting;
                entry.run_at = now;
                entry.recovered = true;
                entry.worker_id = None;
                entry.lease_expires_at = None;
            }
            stalled.push(StalledItem { delivery, exhausted });
        }
        Ok(stalled)
    }

    async fn get_info(&self, job_id: &JobId) -> QueueResult<QueueInfo> {
        self.check_faults()?;
        let inner = self.inner.lock().await;
        let Some(entry) = inner.items.get(job_id) else {
            return Ok(QueueInfo::not_found());
        };

        let position = match entry.state {
            QueueState::Waiting => inner
                .wait_line()
                .iter()
                .position(|(id, _)| *id == job_id)
                .map_or(-1, |idx| idx as i64 + 1),
            _ => 0,
        };
        Ok(QueueInfo::for_state(entry.state, position, &self.settings))
    }

    async fn remove(&self, job_id: &JobId) -> QueueResult<bool> {
        self.check_faults()?;
        Ok(self.inner.lock().await.items.remove(job_id).is_some())
    }

    async fn purge_finished(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> QueueResult<u64> {
        self.check_faults()?;
        let mut inner = self.inner.lock().await;
        let before = inner.items.len();
        inner.items.retain(|_, e| match (e.state, e.finished_at) {
            (QueueState::Completed, Some(at)) => at >= completed_before,
            (QueueState::Failed, Some(at)) => at >= failed_before,
            _ => true,
        });
        Ok((before - inner.items.len()) as u64)
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check_faults()
    }
}
