//! Job infrastructure for URL analysis.
//!
//! # Architecture
//!
//! ```text
//! POST /api/analyse
//!     │
//!     └─► JobLifecycle.submit()
//!             ├─► JobStore.create(PENDING)
//!             └─► WorkQueue.enqueue()
//!
//! QueueWorker
//!     │
//!     ├─► Reap stalled leases
//!     ├─► Claim items (WorkQueue)
//!     ├─► JobLifecycle.handle()
//!     │       ├─► PENDING → PROCESSING (conditional)
//!     │       ├─► fetch + parse
//!     │       └─► COMPLETED / FAILED (conditional)
//!     └─► Complete / fail / retry the item
//!
//! CleanupSweeper
//!     │
//!     └─► Fail lost and stuck jobs, purge expired data
//! ```

pub mod events;
mod job_store;
pub mod lifecycle;
mod memory_queue;
mod memory_store;
mod postgres_queue;
mod postgres_store;
mod queue;
mod record;
pub mod sweeper;
mod worker;

pub use events::QueueEvent;
pub use job_store::{JobStore, JobStoreError, RetryingJobStore, StoreResult};
pub use lifecycle::{JobLifecycle, JobView, LifecycleError, ProcessOutcome, Submission};
pub use memory_queue::MemoryWorkQueue;
pub use memory_store::MemoryJobStore;
pub use postgres_queue::PostgresWorkQueue;
pub use postgres_store::PostgresJobStore;
pub use queue::{
    Backoff, Delivery, DeliveryHandle, EnqueueOptions, FailOutcome, QueueError, QueueInfo,
    QueueResult, QueueSettings, QueueState, StalledItem, WorkItem, WorkQueue,
};
pub use record::{FailureType, JobPatch, JobRecord, JobStatus};
pub use sweeper::{CleanupSweeper, SweepReport, SweepStats, SweeperConfig};
pub use worker::{ProcessError, QueueWorker, QueueWorkerConfig, WorkHandler};
