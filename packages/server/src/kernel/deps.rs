//! Server dependencies shared by the HTTP layer and background services.
//!
//! Storage and queue are trait objects so tests can swap in the in-memory
//! backends without touching the wiring.

use std::sync::Arc;
use std::time::Duration;

use extraction::Fetcher;
use sqlx::PgPool;

use crate::config::Config;
use crate::kernel::jobs::{
    Backoff, CleanupSweeper, EnqueueOptions, JobLifecycle, JobStore, MemoryJobStore,
    MemoryWorkQueue, PostgresJobStore, PostgresWorkQueue, QueueSettings, QueueWorker,
    QueueWorkerConfig, RetryingJobStore, SweeperConfig, WorkQueue,
};

// =============================================================================
// ServerDeps
// =============================================================================

#[derive(Clone)]
pub struct ServerDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub lifecycle: Arc<JobLifecycle>,
    pub sweeper: Arc<CleanupSweeper>,
}

impl ServerDeps {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        fetcher: Arc<dyn Fetcher>,
        config: &Config,
    ) -> Self {
        let lifecycle = JobLifecycle::new(store.clone(), queue.clone(), fetcher)
            .with_enqueue_options(enqueue_options(config))
            .with_dns_check(config.dns_check);
        let sweeper = CleanupSweeper::new(store.clone(), queue.clone(), sweeper_config(config));

        Self {
            store,
            queue,
            lifecycle: Arc::new(lifecycle),
            sweeper: Arc::new(sweeper),
        }
    }

    /// PostgreSQL-backed store and queue sharing one pool.
    pub fn postgres(pool: PgPool, fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        let store = RetryingJobStore::new(PostgresJobStore::with_ttl(pool.clone(), config.job_ttl));
        let queue = PostgresWorkQueue::new(pool, queue_settings(config));
        Self::new(Arc::new(store), Arc::new(queue), fetcher, config)
    }

    /// Process-local store and queue. Nothing survives a restart.
    pub fn in_memory(fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        let store = RetryingJobStore::new(MemoryJobStore::with_ttl(config.job_ttl));
        let queue = MemoryWorkQueue::new(queue_settings(config));
        Self::new(Arc::new(store), Arc::new(queue), fetcher, config)
    }

    /// A worker pool that feeds deliveries into the lifecycle.
    pub fn worker(&self, config: &Config) -> QueueWorker {
        let worker_config = QueueWorkerConfig {
            concurrency: config.worker_concurrency,
            poll_interval: config.queue_poll_interval,
            heartbeat_interval: (config.queue_lease / 3).max(Duration::from_millis(100)),
            drain_timeout: config.shutdown_grace,
            ..QueueWorkerConfig::default()
        };
        QueueWorker::new(self.queue.clone(), self.lifecycle.clone(), worker_config)
    }
}

pub fn queue_settings(config: &Config) -> QueueSettings {
    QueueSettings {
        lease: config.queue_lease,
        item_estimate: config.queue_job_timeout,
        concurrency: config.worker_concurrency,
    }
}

pub fn enqueue_options(config: &Config) -> EnqueueOptions {
    EnqueueOptions {
        timeout_ms: config.queue_job_timeout.as_millis() as u64,
        max_attempts: config.queue_max_attempts,
        backoff: Backoff::Exponential {
            base_ms: config.queue_backoff_base.as_millis() as u64,
        },
    }
}

pub fn sweeper_config(config: &Config) -> SweeperConfig {
    SweeperConfig {
        interval: config.cleanup_interval,
        stale_after: config.cleanup_stale_pending,
        max_age: config.cleanup_max_age,
        ..SweeperConfig::default()
    }
}
