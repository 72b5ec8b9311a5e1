//! Queue worker pool.
//!
//! The `QueueWorker` is a long-running service that:
//! - Polls the [`WorkQueue`] for ready items, up to `concurrency` at a time
//! - Runs each item through a [`WorkHandler`] under the item's timeout
//! - Heartbeats the lease while the handler runs
//! - Reports the outcome back to the queue (complete / retry / fail)
//! - Recovers stalled items whose holder stopped heartbeating
//!
//! # Architecture
//!
//! ```text
//! QueueWorker
//!     │
//!     ├─► reap_stalled()          (lease expired → redeliver or exhaust)
//!     ├─► claim(free slots)
//!     ├─► spawn per item
//!     │       ├─► heartbeat task
//!     │       └─► handler.process(delivery) under timeout
//!     └─► complete / fail → QueueEvent broadcast
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::QueueEvent;
use super::queue::{Delivery, FailOutcome, QueueError, QueueResult, WorkQueue};
use crate::common::JobId;

const EVENT_CAPACITY: usize = 256;

/// How a handler invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Worth another attempt after backoff.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help.
    #[error("{0}")]
    Permanent(String),
}

/// Business logic run for each delivered item.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessError>;

    /// Called before a retryable failure is handed back to the queue, when
    /// another attempt will follow. On error the item is not handed back;
    /// it is redelivered as recovered once its lease runs out.
    async fn on_retry(&self, _delivery: &Delivery) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when an item has used up its attempts.
    async fn on_exhausted(&self, delivery: &Delivery, error: &str);
}

/// Configuration for the queue worker.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Worker ID for this instance; owns leases
    pub worker_id: String,
    /// Items processed at the same time
    pub concurrency: usize,
    /// Sleep between polls when nothing is ready
    pub poll_interval: Duration,
    /// How often running items renew their lease
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight items
    pub drain_timeout: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(25),
        }
    }
}

/// A worker pool draining a [`WorkQueue`].
#[derive(Clone)]
pub struct QueueWorker {
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn WorkHandler>,
    config: Arc<QueueWorkerConfig>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        handler: Arc<dyn WorkHandler>,
        config: QueueWorkerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            handler,
            config: Arc::new(config),
            events,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Receive delivery events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Poll until `shutdown` fires, then drain in-flight items.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "queue worker starting"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            self.reap().await;

            let free = self.config.concurrency.saturating_sub(tasks.len());
            let claimed = if free == 0 {
                Vec::new()
            } else {
                match self.queue.claim(&self.config.worker_id, free).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        error!(error = %e, "failed to claim work items");
                        Vec::new()
                    }
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
                }
                continue;
            }

            debug!(count = claimed.len(), "claimed work items");
            for delivery in claimed {
                let worker = self.clone();
                tasks.spawn(async move { worker.execute(delivery).await });
            }
        }

        if !tasks.is_empty() {
            info!(count = tasks.len(), "waiting for in-flight items to finish");
            let drained = tokio::time::timeout(self.config.drain_timeout, async {
                while let Some(joined) = tasks.join_next().await {
                    log_join(joined);
                }
            })
            .await;

            if drained.is_err() {
                // Abandoned items are redelivered once their leases expire.
                warn!(remaining = tasks.len(), "drain timed out, aborting in-flight items");
                tasks.abort_all();
            }
        }

        info!(worker_id = %self.config.worker_id, "queue worker stopped");
    }

    /// Recover stalled items, then claim one batch and process it to the end.
    pub async fn run_once(&self) -> QueueResult<usize> {
        self.reap().await;
        let claimed = self
            .queue
            .claim(&self.config.worker_id, self.config.concurrency)
            .await?;
        let count = claimed.len();
        futures::future::join_all(claimed.into_iter().map(|d| self.execute(d))).await;
        Ok(count)
    }

    async fn reap(&self) {
        let stalled = match self.queue.reap_stalled().await {
            Ok(stalled) => stalled,
            Err(e) => {
                warn!(error = %e, "failed to check for stalled items");
                return;
            }
        };

        for item in stalled {
            let delivery = item.delivery;
            warn!(
                job_id = %delivery.job_id(),
                attempt = delivery.attempt,
                exhausted = item.exhausted,
                "work item stalled"
            );
            self.emit(QueueEvent::Stalled {
                job_id: delivery.job_id().clone(),
                attempt: delivery.attempt,
                exhausted: item.exhausted,
            });

            if item.exhausted {
                let reason = "lease expired without heartbeat";
                self.handler.on_exhausted(&delivery, reason).await;
                self.emit(QueueEvent::Exhausted {
                    job_id: delivery.job_id().clone(),
                    attempts: delivery.attempt,
                    error: reason.to_string(),
                });
            }
        }
    }

    /// Process one delivery with periodic heartbeats.
    async fn execute(&self, delivery: Delivery) {
        let job_id = delivery.job_id().clone();
        let started = Instant::now();

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job_id.clone(), heartbeat_cancel.clone());

        let result = match tokio::time::timeout(delivery.timeout(), self.handler.process(&delivery)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Retryable(format!(
                "processing timed out after {}ms",
                delivery.timeout_ms
            ))),
        };

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        match result {
            Ok(()) => self.finish(&delivery, started).await,
            Err(ProcessError::Permanent(message)) => {
                match self.queue.fail(&job_id, &self.config.worker_id, &message, false).await {
                    Ok(_) => self.emit(QueueEvent::Failed {
                        job_id,
                        attempt: delivery.attempt,
                        error: message,
                    }),
                    Err(e) => self.report_queue_error(&job_id, "fail", &e),
                }
            }
            Err(ProcessError::Retryable(message)) => self.retry(&delivery, message).await,
        }
    }

    async fn finish(&self, delivery: &Delivery, started: Instant) {
        let job_id = delivery.job_id();
        match self.queue.complete(job_id, &self.config.worker_id).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(job_id = %job_id, duration_ms, "work item completed");
                self.emit(QueueEvent::Completed {
                    job_id: job_id.clone(),
                    attempt: delivery.attempt,
                    duration_ms,
                });
            }
            Err(e) => self.report_queue_error(job_id, "complete", &e),
        }
    }

    async fn retry(&self, delivery: &Delivery, message: String) {
        let job_id = delivery.job_id();
        if !delivery.is_last_attempt() {
            if let Err(e) = self.handler.on_retry(delivery).await {
                warn!(
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    error = %e,
                    "retry preparation failed, leaving item to lease expiry"
                );
                return;
            }
        }

        match self.queue.fail(job_id, &self.config.worker_id, &message, true).await {
            Ok(FailOutcome::Retrying { run_at }) => {
                warn!(
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    max_attempts = delivery.max_attempts,
                    run_at = %run_at,
                    error = %message,
                    "work item failed, will retry"
                );
                self.emit(QueueEvent::Retrying {
                    job_id: job_id.clone(),
                    attempt: delivery.attempt,
                    run_at,
                    error: message,
                });
            }
            Ok(FailOutcome::Exhausted | FailOutcome::Failed) => {
                warn!(
                    job_id = %job_id,
                    attempts = delivery.attempt,
                    error = %message,
                    "work item exhausted its attempts"
                );
                self.handler.on_exhausted(delivery, &message).await;
                self.emit(QueueEvent::Exhausted {
                    job_id: job_id.clone(),
                    attempts: delivery.attempt,
                    error: message,
                });
            }
            Err(e) => self.report_queue_error(job_id, "fail", &e),
        }
    }

    fn spawn_heartbeat(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match queue.heartbeat(&job_id, &worker_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(job_id = %job_id, "lease lost while processing");
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }

    fn report_queue_error(&self, job_id: &JobId, operation: &str, error: &QueueError) {
        match error {
            // Someone else owns the item now; their outcome wins.
            QueueError::LeaseLost(_) => {
                warn!(job_id = %job_id, operation, "lease lost before outcome was recorded")
            }
            other => error!(
                job_id = %job_id,
                operation,
                error = %other,
                "failed to record outcome, item will be recovered after its lease expires"
            ),
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "work item task panicked");
        }
    }
}
