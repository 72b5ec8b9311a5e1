//! Work queue abstraction.
//!
//! The queue owns delivery: attempts, backoff, leases and stalled-item
//! recovery. It knows nothing about job records; the job store stays the
//! source of truth for business state.
//!
//! # Item states
//!
//! ```text
//! enqueue ─► waiting ──claim──► active ──complete──► completed
//!               ▲                  │
//!               └──fail(retry)─────┤
//!               └──lease expired───┤
//!                                  └──fail(final)──► failed
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::JobId;

/// Payload delivered to workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub url: String,
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempt - 1)`
    Exponential { base_ms: u64 },
}

impl Backoff {
    /// Delay before the next try, given how many attempts have been made.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms } => {
                let shift = attempts.saturating_sub(1).min(20);
                Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
            }
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Backoff::Fixed { .. } => "fixed",
            Backoff::Exponential { .. } => "exponential",
        }
    }

    pub(crate) fn millis(&self) -> u64 {
        match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { base_ms } => base_ms,
        }
    }

    pub(crate) fn from_parts(kind: &str, millis: u64) -> Self {
        match kind {
            "fixed" => Backoff::Fixed { delay_ms: millis },
            _ => Backoff::Exponential { base_ms: millis },
        }
    }
}

/// Per-item delivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Hard limit for one handler invocation
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 3,
            backoff: Backoff::Exponential { base_ms: 1_000 },
        }
    }
}

/// Receipt for an accepted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub job_id: JobId,
    pub enqueued_at: DateTime<Utc>,
}

/// A claimed item plus its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub item: WorkItem,
    /// 1-based; includes this delivery
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    /// Re-claimed after the previous holder's lease expired.
    pub recovered: bool,
}

impl Delivery {
    pub fn job_id(&self) -> &JobId {
        &self.item.job_id
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// An active item whose lease ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledItem {
    pub delivery: Delivery,
    /// No attempts remain; the item has been failed.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Waiting => "waiting",
            QueueState::Active => "active",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, QueueState::Completed | QueueState::Failed)
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(QueueState::Waiting),
            "active" => Some(QueueState::Active),
            "completed" => Some(QueueState::Completed),
            "failed" => Some(QueueState::Failed),
            _ => None,
        }
    }
}

/// Live view of one item.
///
/// `position` is 0 while active, the 1-based place in the wait line while
/// waiting, and -1 when the item is unknown or finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub found: bool,
    pub state: Option<QueueState>,
    pub position: i64,
    pub estimated_wait_ms: Option<u64>,
}

impl QueueInfo {
    pub fn not_found() -> Self {
        Self {
            found: false,
            state: None,
            position: -1,
            estimated_wait_ms: None,
        }
    }

    pub(crate) fn for_state(state: QueueState, position: i64, settings: &QueueSettings) -> Self {
        let (position, estimated_wait_ms) = match state {
            QueueState::Active => (0, Some(0)),
            QueueState::Waiting => (position, Some(settings.estimate_wait_ms(position))),
            QueueState::Completed | QueueState::Failed => (-1, None),
        };
        Self {
            found: true,
            state: Some(state),
            position,
            estimated_wait_ms,
        }
    }
}

/// Result of failing an active item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Will be redelivered at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    /// Retryable failure with no attempts left.
    Exhausted,
    /// Permanent failure; not retried.
    Failed,
}

/// Settings shared by queue backends.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a claimed item stays owned without a heartbeat.
    pub lease: Duration,
    /// Processing time assumed per waiting item for wait estimates.
    pub item_estimate: Duration,
    /// Worker slots draining the queue.
    pub concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            item_estimate: Duration::from_secs(5),
            concurrency: 2,
        }
    }
}

impl QueueSettings {
    pub fn estimate_wait_ms(&self, position: i64) -> u64 {
        let position = position.max(0) as u64;
        let per_item = self.item_estimate.as_millis() as u64;
        position.saturating_mul(per_item) / self.concurrency.max(1) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Backend cannot accept or serve work right now
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job {0} is already queued")]
    Duplicate(JobId),

    /// The caller no longer holds the item (lease expired and reassigned)
    #[error("worker does not hold job {0}")]
    LeaseLost(JobId),

    #[error("queue error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Durable at-least-once work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Accept an item for delivery.
    async fn enqueue(&self, item: WorkItem, options: &EnqueueOptions) -> QueueResult<DeliveryHandle>;

    /// Take up to `limit` ready items, oldest first, leasing them to `worker_id`.
    async fn claim(&self, worker_id: &str, limit: usize) -> QueueResult<Vec<Delivery>>;

    /// Extend the lease. Returns false if the worker no longer holds the item.
    async fn heartbeat(&self, job_id: &JobId, worker_id: &str) -> QueueResult<bool>;

    async fn complete(&self, job_id: &JobId, worker_id: &str) -> QueueResult<()>;

    /// Record a failed attempt. Retryable failures with attempts left go back
    /// to the wait line after backoff.
    async fn fail(
        &self,
        job_id: &JobId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome>;

    /// Release items whose lease expired. Items with attempts left return to
    /// the wait line flagged as recovered; the rest are failed.
    async fn reap_stalled(&self) -> QueueResult<Vec<StalledItem>>;

    async fn get_info(&self, job_id: &JobId) -> QueueResult<QueueInfo>;

    /// Drop an item regardless of state. Returns whether it existed.
    async fn remove(&self, job_id: &JobId) -> QueueResult<bool>;

    /// Delete finished bookkeeping older than the given cutoffs.
    async fn purge_finished(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> QueueResult<u64>;

    async fn ping(&self) -> QueueResult<()>;
}
