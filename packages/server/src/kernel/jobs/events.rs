use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::JobId;

/// Queue delivery events.
///
/// These are facts about delivery, broadcast by the [`QueueWorker`] for
/// observers (logging, tests). Business state changes go through the
/// [`WorkHandler`] callbacks, not through these events.
///
/// [`QueueWorker`]: super::QueueWorker
/// [`WorkHandler`]: super::WorkHandler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Completed {
        job_id: JobId,
        attempt: u32,
        duration_ms: u64,
    },

    /// Retryable failure; the item goes back to the wait line.
    Retrying {
        job_id: JobId,
        attempt: u32,
        run_at: DateTime<Utc>,
        error: String,
    },

    /// Permanent failure reported by the handler.
    Failed {
        job_id: JobId,
        attempt: u32,
        error: String,
    },

    /// Retries used up.
    Exhausted {
        job_id: JobId,
        attempts: u32,
        error: String,
    },

    /// The holder stopped heartbeating and the lease ran out.
    Stalled {
        job_id: JobId,
        attempt: u32,
        exhausted: bool,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueEvent::Completed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Exhausted { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => job_id,
        }
    }
}
