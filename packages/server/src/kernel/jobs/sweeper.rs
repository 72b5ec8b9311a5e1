//! Periodic reconciliation of lost and stuck jobs.
//!
//! ```text
//! every interval
//!     │
//!     ├─► PENDING older than stale threshold
//!     │       ├─► no live queue item      → FAILED (TIMEOUT, lost)
//!     │       └─► queued past max age     → remove item, FAILED (TIMEOUT)
//!     ├─► PROCESSING older than stale threshold
//!     │       ├─► no live queue item      → FAILED (TIMEOUT)
//!     │       └─► queued past max age     → remove item, FAILED (TIMEOUT)
//!     ├─► purge finished queue bookkeeping
//!     └─► purge expired job records
//! ```
//!
//! Terminal jobs are never touched here; they age out through the store TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::job_store::JobStore;
use super::queue::WorkQueue;
use super::record::{FailureType, JobPatch, JobRecord, JobStatus};

pub const LOST_JOB_MESSAGE: &str =
    "Job was lost before processing finished. Please submit the URL again.";
pub const STUCK_JOB_MESSAGE: &str =
    "Job timed out waiting for processing. Please submit the URL again.";

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Age after which a non-terminal job is checked against the queue
    pub stale_after: Duration,
    /// Age after which a still-queued job is cancelled
    pub max_age: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    /// Records examined per status per run
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(30 * 60),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            batch_size: 500,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub jobs_checked: u64,
    pub orphaned_failed: u64,
    pub stuck_failed: u64,
    pub queue_items_purged: u64,
    pub records_expired: u64,
    pub errors: u64,
}

/// Totals since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub runs: u64,
    pub jobs_checked: u64,
    pub orphaned_failed: u64,
    pub stuck_failed: u64,
    pub queue_items_purged: u64,
    pub records_expired: u64,
    pub errors: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: Option<u64>,
}

impl SweepStats {
    fn record(&mut self, report: &SweepReport, at: DateTime<Utc>, duration: Duration) {
        self.runs += 1;
        self.jobs_checked += report.jobs_checked;
        self.orphaned_failed += report.orphaned_failed;
        self.stuck_failed += report.stuck_failed;
        self.queue_items_purged += report.queue_items_purged;
        self.records_expired += report.records_expired;
        self.errors += report.errors;
        self.last_run_at = Some(at);
        self.last_run_duration_ms = Some(duration.as_millis() as u64);
    }
}

pub struct CleanupSweeper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    config: SweeperConfig,
    stats: RwLock<SweepStats>,
    /// Serializes scheduled and forced runs.
    running: Mutex<()>,
}

impl CleanupSweeper {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>, config: SweeperConfig) -> Self {
        Self {
            store,
            queue,
            config,
            stats: RwLock::new(SweepStats::default()),
            running: Mutex::new(()),
        }
    }

    pub async fn stats(&self) -> SweepStats {
        self.stats.read().await.clone()
    }

    /// Sweep on the configured interval until `shutdown` fires. The first
    /// sweep runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "cleanup sweeper starting"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }

        info!("cleanup sweeper stopped");
    }

    /// Run one sweep now. Also the operational force-run hook.
    pub async fn run_once(&self) -> SweepReport {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let now = Utc::now();
        let mut report = SweepReport::default();

        let cutoff = now - chrono_duration(self.config.stale_after);
        for status in [JobStatus::Pending, JobStatus::Processing] {
            match self
                .store
                .find_stale(&[status.clone()], cutoff, self.config.batch_size)
                .await
            {
                Ok(jobs) => {
                    for job in jobs {
                        report.jobs_checked += 1;
                        self.reconcile(&job, now, &mut report).await;
                    }
                }
                Err(e) => {
                    error!(status = %status, error = %e, "failed to list stale jobs");
                    report.errors += 1;
                }
            }
        }

        match self
            .queue
            .purge_finished(
                now - chrono_duration(self.config.completed_retention),
                now - chrono_duration(self.config.failed_retention),
            )
            .await
        {
            Ok(purged) => report.queue_items_purged = purged,
            Err(e) => {
                warn!(error = %e, "failed to purge finished queue items");
                report.errors += 1;
            }
        }

        match self.store.purge_expired().await {
            Ok(expired) => report.records_expired = expired,
            Err(e) => {
                warn!(error = %e, "failed to purge expired job records");
                report.errors += 1;
            }
        }

        let elapsed = started.elapsed();
        self.stats.write().await.record(&report, now, elapsed);
        info!(
            checked = report.jobs_checked,
            orphaned = report.orphaned_failed,
            stuck = report.stuck_failed,
            queue_purged = report.queue_items_purged,
            expired = report.records_expired,
            errors = report.errors,
            duration_ms = elapsed.as_millis() as u64,
            "cleanup sweep finished"
        );
        report
    }

    async fn reconcile(&self, job: &JobRecord, now: DateTime<Utc>, report: &mut SweepReport) {
        let info = match self.queue.get_info(&job.job_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "failed to look up queue item");
                report.errors += 1;
                return;
            }
        };

        let live = info.found && !info.state.is_some_and(|s| s.is_finished());
        if !live {
            if self.fail(job, LOST_JOB_MESSAGE, report).await {
                warn!(job_id = %job.job_id, status = %job.status, "failed job lost by the queue");
                report.orphaned_failed += 1;
            }
            return;
        }

        let age = now - job.created_at;
        if age <= chrono_duration(self.config.max_age) {
            return;
        }

        if let Err(e) = self.queue.remove(&job.job_id).await {
            warn!(job_id = %job.job_id, error = %e, "failed to remove stuck queue item");
            report.errors += 1;
            return;
        }
        if self.fail(job, STUCK_JOB_MESSAGE, report).await {
            warn!(
                job_id = %job.job_id,
                age_secs = age.num_seconds(),
                "cancelled job stuck in queue"
            );
            report.stuck_failed += 1;
        }
    }

    /// Fail `job` if it is still in the status it was listed with.
    async fn fail(&self, job: &JobRecord, message: &str, report: &mut SweepReport) -> bool {
        let patch = JobPatch::failed(message, FailureType::Timeout);
        match self
            .store
            .update_if_status(&job.job_id, &[job.status.clone()], &patch)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to mark job as timed out");
                report.errors += 1;
                false
            }
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
