//! Job lifecycle controller.
//!
//! Drives every job through its state machine and keeps the job store and
//! the work queue consistent with each other:
//!
//! ```text
//! PENDING ──claim──► PROCESSING ──fetch+parse ok──► COMPLETED
//!    ▲                   │
//!    └──retryable fail───┤
//!                        ├──permanent fail──► FAILED
//!                        └──attempts exhausted──► FAILED ("exceeded retry attempts")
//! ```
//!
//! Every transition is a conditional store write, so duplicate deliveries,
//! stalled-item recovery and the cleanup sweeper can race freely: a record
//! reaches a terminal state at most once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extraction::{FetchError, Fetcher, MetadataParser, UrlValidator, ValidationError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::job_store::{JobStore, JobStoreError};
use super::queue::{Delivery, EnqueueOptions, QueueError, WorkItem, WorkQueue};
use super::record::{FailureType, JobPatch, JobRecord, JobStatus};
use super::worker::{ProcessError, WorkHandler};
use crate::common::{JobId, JobIdError, JobIdGenerator};

pub const QUEUE_FAILURE_MESSAGE: &str = "Failed to queue job";
pub const RETRIES_EXHAUSTED_MESSAGE: &str = "exceeded retry attempts";
pub const DEFAULT_FAILURE_MESSAGE: &str = "Job processing failed";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    InvalidFormat(#[from] JobIdError),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(JobStoreError),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(QueueError),

    /// A stored status this build does not know. Indicates corrupted data.
    #[error("job {job_id} has unknown status '{status}'")]
    UnknownStatus { job_id: JobId, status: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JobStoreError> for LifecycleError {
    fn from(error: JobStoreError) -> Self {
        if error.is_unavailable() {
            LifecycleError::StorageUnavailable(error)
        } else {
            LifecycleError::Internal(error.to_string())
        }
    }
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: JobId,
    pub url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// What the worker did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed { error: String },
    /// Another delivery already claimed or finished the job.
    AlreadyHandled,
}

/// Client-facing view of a job.
///
/// `status` is the presented status: a stored PENDING job that the queue
/// reports at a wait-line position above zero is shown as PROCESSING. The
/// view is never written back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub url: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<FailureType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_ms: Option<u64>,
}

impl JobView {
    fn base(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            status: record.status.clone(),
            url: record.url.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            results: None,
            error: None,
            error_type: None,
            http_status_code: record.http_status_code,
            queue_position: None,
            estimated_wait_ms: None,
        }
    }
}

/// A failed analysis attempt.
#[derive(Debug, Clone, PartialEq)]
struct AnalysisFailure {
    message: String,
    error_type: FailureType,
    http_status_code: Option<u16>,
    retryable: bool,
}

impl AnalysisFailure {
    fn permanent(message: impl Into<String>, error_type: FailureType) -> Self {
        Self {
            message: message.into(),
            error_type,
            http_status_code: None,
            retryable: false,
        }
    }
}

impl From<FetchError> for AnalysisFailure {
    fn from(error: FetchError) -> Self {
        Self {
            error_type: failure_type(&error),
            http_status_code: error.status_code(),
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}

fn failure_type(error: &FetchError) -> FailureType {
    match error {
        FetchError::Http { .. } => FailureType::HttpError,
        FetchError::Timeout { .. } => FailureType::Timeout,
        FetchError::Connection { .. } | FetchError::Request { .. } => FailureType::NetworkError,
        FetchError::Dns { .. } => FailureType::DnsError,
        FetchError::Tls { .. } => FailureType::TlsError,
        FetchError::RedirectLoop { .. } => FailureType::RedirectLoop,
        FetchError::BlockedRedirect { .. } => FailureType::BlockedUrl,
    }
}

pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    fetcher: Arc<dyn Fetcher>,
    ids: Arc<JobIdGenerator>,
    validator: UrlValidator,
    parser: MetadataParser,
    enqueue_options: EnqueueOptions,
    resolve_dns: bool,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            store,
            queue,
            fetcher,
            ids: Arc::new(JobIdGenerator::new()),
            validator: UrlValidator::new(),
            parser: MetadataParser::new(),
            enqueue_options: EnqueueOptions::default(),
            resolve_dns: false,
        }
    }

    pub fn with_validator(mut self, validator: UrlValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_enqueue_options(mut self, options: EnqueueOptions) -> Self {
        self.enqueue_options = options;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<JobIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Re-check the host's resolved addresses before fetching.
    pub fn with_dns_check(mut self, enabled: bool) -> Self {
        self.resolve_dns = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate, record and enqueue a new job.
    ///
    /// Work is only enqueued once the PENDING record is durable. If the queue
    /// then refuses the item, the record is failed so it never sits PENDING
    /// without queued work.
    pub async fn submit(&self, url: &str) -> Result<Submission, LifecycleError> {
        let url = url.trim();
        self.validator.validate(url)?;

        let job_id = self.ids.allocate_async().await;
        let record = self
            .store
            .create(JobRecord::pending(job_id.clone(), url))
            .await
            .map_err(|e| {
                error!(job_id = %job_id, error = %e, "failed to store new job");
                LifecycleError::from(e)
            })?;

        let item = WorkItem {
            job_id: job_id.clone(),
            url: record.url.clone(),
        };
        if let Err(e) = self.queue.enqueue(item, &self.enqueue_options).await {
            error!(job_id = %job_id, error = %e, "failed to enqueue job");
            self.fail_unqueued(&job_id).await;
            return Err(LifecycleError::QueueUnavailable(e));
        }

        info!(job_id = %job_id, url = %record.url, "job submitted");
        Ok(Submission {
            job_id,
            url: record.url,
            status: record.status,
            created_at: record.created_at,
        })
    }

    async fn fail_unqueued(&self, job_id: &JobId) {
        let patch = JobPatch::failed(QUEUE_FAILURE_MESSAGE, FailureType::QueueError);
        match self
            .store
            .update_if_status(job_id, &[JobStatus::Pending], &patch)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job_id, "unqueued job was no longer pending"),
            Err(e) => error!(
                job_id = %job_id,
                error = %e,
                "failed to mark unqueued job as failed; sweeper will reconcile it"
            ),
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Run one delivery through the state machine.
    ///
    /// `Err` is only returned for failures the queue should retry.
    pub async fn handle(&self, delivery: &Delivery) -> Result<ProcessOutcome, ProcessError> {
        let job_id = delivery.job_id();

        // A recovered delivery may find the job still PROCESSING under the
        // worker that stalled.
        let claimable: &[JobStatus] = if delivery.recovered {
            &[JobStatus::Pending, JobStatus::Processing]
        } else {
            &[JobStatus::Pending]
        };
        let claimed = self
            .store
            .update_if_status(job_id, claimable, &JobPatch::processing())
            .await
            .map_err(|e| ProcessError::Retryable(format!("failed to claim job: {e}")))?;
        if !claimed {
            info!(job_id = %job_id, attempt = delivery.attempt, "job already handled, skipping");
            return Ok(ProcessOutcome::AlreadyHandled);
        }

        debug!(
            job_id = %job_id,
            attempt = delivery.attempt,
            recovered = delivery.recovered,
            "processing job"
        );

        match self.analyse(&delivery.item.url).await {
            Ok((results, status_code)) => {
                let patch = JobPatch::completed(results, status_code);
                if self.finalize(job_id, &patch).await? {
                    info!(job_id = %job_id, status_code, "job completed");
                    Ok(ProcessOutcome::Completed)
                } else {
                    Ok(ProcessOutcome::AlreadyHandled)
                }
            }
            Err(failure) if failure.retryable => {
                warn!(
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    error = %failure.message,
                    "retryable analysis failure"
                );
                Err(ProcessError::Retryable(failure.message))
            }
            Err(failure) => {
                let patch = JobPatch::failed(failure.message.clone(), failure.error_type)
                    .with_http_status(failure.http_status_code);
                if self.finalize(job_id, &patch).await? {
                    warn!(
                        job_id = %job_id,
                        error_type = %failure.error_type,
                        error = %failure.message,
                        "job failed"
                    );
                    Ok(ProcessOutcome::Failed {
                        error: failure.message,
                    })
                } else {
                    Ok(ProcessOutcome::AlreadyHandled)
                }
            }
        }
    }

    /// Fetch and parse `url`, returning the results document and HTTP status.
    async fn analyse(&self, url: &str) -> Result<(serde_json::Value, u16), AnalysisFailure> {
        if self.resolve_dns {
            self.validator
                .validate_with_dns(url)
                .await
                .map_err(|e| match e {
                    ValidationError::DnsResolution(_) => {
                        AnalysisFailure::permanent(e.to_string(), FailureType::DnsError)
                    }
                    other => AnalysisFailure::permanent(other.to_string(), FailureType::BlockedUrl),
                })?;
        }

        let page = self.fetcher.fetch(url).await?;
        let metadata = self.parser.parse(&page.html, &page.url);
        if metadata.parse_error {
            return Err(AnalysisFailure {
                http_status_code: Some(page.status_code),
                ..AnalysisFailure::permanent(
                    "failed to parse page content",
                    FailureType::ParseError,
                )
            });
        }

        let results = serde_json::to_value(&metadata).map_err(|e| {
            AnalysisFailure::permanent(
                format!("failed to encode results: {e}"),
                FailureType::ParseError,
            )
        })?;
        Ok((results, page.status_code))
    }

    /// Terminal write, guarded on PROCESSING. Returns whether it applied.
    async fn finalize(&self, job_id: &JobId, patch: &JobPatch) -> Result<bool, ProcessError> {
        let applied = self
            .store
            .update_if_status(job_id, &[JobStatus::Processing], patch)
            .await
            .map_err(|e| ProcessError::Retryable(format!("failed to record outcome: {e}")))?;
        if !applied {
            warn!(job_id = %job_id, "job left PROCESSING before its outcome was recorded");
        }
        Ok(applied)
    }

    /// Put a PROCESSING job back to PENDING so the redelivery can claim it.
    ///
    /// On error the job is still PROCESSING and only a recovered delivery
    /// can claim it.
    pub async fn release(&self, delivery: &Delivery) -> Result<(), JobStoreError> {
        let job_id = delivery.job_id();
        let released = self
            .store
            .update_if_status(job_id, &[JobStatus::Processing], &JobPatch::requeued())
            .await
            .inspect_err(|e| warn!(job_id = %job_id, error = %e, "failed to release job for retry"))?;
        if released {
            debug!(job_id = %job_id, "job released for retry");
        }
        Ok(())
    }

    /// Final failure after the queue gave up on the item.
    pub async fn fail_exhausted(&self, delivery: &Delivery, last_error: &str) {
        let job_id = delivery.job_id();
        let patch = JobPatch::failed(RETRIES_EXHAUSTED_MESSAGE, FailureType::RetriesExhausted);
        match self
            .store
            .update_if_status(job_id, &[JobStatus::Pending, JobStatus::Processing], &patch)
            .await
        {
            Ok(true) => warn!(
                job_id = %job_id,
                attempts = delivery.attempt,
                last_error = %last_error,
                "job failed after exhausting retries"
            ),
            Ok(false) => debug!(job_id = %job_id, "exhausted job already terminal"),
            Err(e) => error!(
                job_id = %job_id,
                error = %e,
                "failed to record exhausted job; sweeper will reconcile it"
            ),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Look up a job for a polling client.
    pub async fn status(&self, raw_job_id: &str) -> Result<JobView, LifecycleError> {
        let job_id = JobId::parse(raw_job_id)?;
        let record = self
            .store
            .get(&job_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(job_id.clone()))?;

        let mut view = JobView::base(&record);
        match &record.status {
            JobStatus::Pending => match self.queue.get_info(&job_id).await {
                Ok(info) => {
                    if info.position > 0 {
                        view.status = JobStatus::Processing;
                    }
                    if info.found {
                        view.queue_position = Some(info.position);
                        view.estimated_wait_ms = info.estimated_wait_ms;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "queue info unavailable, reporting stored status")
                }
            },
            JobStatus::Processing => {}
            JobStatus::Completed => view.results = record.results,
            JobStatus::Failed => {
                view.error = Some(
                    record
                        .error
                        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                );
                view.error_type = record.error_type;
            }
            JobStatus::Unrecognized(raw) => {
                error!(job_id = %job_id, status = %raw, "job record has unknown status");
                return Err(LifecycleError::UnknownStatus {
                    job_id,
                    status: raw.clone(),
                });
            }
        }
        Ok(view)
    }
}

#[async_trait]
impl WorkHandler for JobLifecycle {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessError> {
        match self.handle(delivery).await? {
            ProcessOutcome::Completed | ProcessOutcome::AlreadyHandled => Ok(()),
            ProcessOutcome::Failed { error } => Err(ProcessError::Permanent(error)),
        }
    }

    async fn on_retry(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.release(delivery).await?;
        Ok(())
    }

    async fn on_exhausted(&self, delivery: &Delivery, error: &str) {
        self.fail_exhausted(delivery, error).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use extraction::MockFetcher;
    use serde_json::json;

    use super::*;
    use crate::kernel::jobs::memory_queue::MemoryWorkQueue;
    use crate::kernel::jobs::memory_store::MemoryJobStore;
    use crate::kernel::jobs::queue::QueueSettings;

    const PAGE: &str = r#"<html><head><title>Example Domain</title></head>
        <body><h1>Example Domain</h1><p>Some words here.</p></body></html>"#;

    struct Fixture {
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryWorkQueue>,
        lifecycle: JobLifecycle,
    }

    fn fixture(fetcher: MockFetcher) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let lifecycle = JobLifecycle::new(store.clone(), queue.clone(), Arc::new(fetcher));
        Fixture {
            store,
            queue,
            lifecycle,
        }
    }

    fn delivery(job_id: &JobId, url: &str, attempt: u32) -> Delivery {
        Delivery {
            item: WorkItem {
                job_id: job_id.clone(),
                url: url.to_string(),
            },
            attempt,
            max_attempts: 3,
            timeout_ms: 5_000,
            recovered: false,
        }
    }

    #[tokio::test]
    async fn submit_stores_pending_record_and_enqueues() {
        let f = fixture(MockFetcher::new());
        let submission = f.lifecycle.submit("https://example.com").await.unwrap();

        assert_eq!(submission.job_id.as_str().len(), 19);
        assert_eq!(submission.status, JobStatus::Pending);
        let stored = f.store.get(&submission.job_id).await.unwrap().unwrap();
        assert_eq!(stored.url, "https://example.com");
        assert!(f.queue.get_info(&submission.job_id).await.unwrap().found);
    }

    #[tokio::test]
    async fn submit_rejects_private_urls_without_side_effects() {
        let f = fixture(MockFetcher::new());
        let err = f.lifecycle.submit("http://localhost:3000").await.unwrap_err();

        assert!(matches!(err, LifecycleError::Validation(_)));
        assert!(err.to_string().contains("invalid URL"));
        assert!(f.store.is_empty().await);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn storage_failure_aborts_before_enqueue() {
        let f = fixture(MockFetcher::new());
        f.store.set_offline(true);

        let err = f.lifecycle.submit("https://example.com").await.unwrap_err();
        assert!(matches!(err, LifecycleError::StorageUnavailable(_)));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn queue_failure_marks_stored_job_failed() {
        let f = fixture(MockFetcher::new());
        f.queue.set_offline(true);

        let err = f.lifecycle.submit("https://example.com").await.unwrap_err();
        assert!(matches!(err, LifecycleError::QueueUnavailable(_)));

        let stale = f
            .store
            .find_stale(&[JobStatus::Failed], Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].error.as_deref(), Some(QUEUE_FAILURE_MESSAGE));
        assert_eq!(stale[0].error_type, Some(FailureType::QueueError));
    }

    #[tokio::test]
    async fn successful_analysis_completes_job() {
        let f = fixture(MockFetcher::new().with_page("https://example.com", PAGE));
        let job = f.lifecycle.submit("https://example.com").await.unwrap();

        let outcome = f
            .lifecycle
            .handle(&delivery(&job.job_id, "https://example.com", 1))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let view = f.lifecycle.status(job.job_id.as_str()).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.http_status_code, Some(200));
        assert_eq!(view.results.unwrap()["title"], json!("Example Domain"));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let fetcher = MockFetcher::new().with_page("https://example.com", PAGE);
        let f = fixture(fetcher.clone());
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        let d = delivery(&job.job_id, "https://example.com", 1);

        assert_eq!(f.lifecycle.handle(&d).await.unwrap(), ProcessOutcome::Completed);
        assert_eq!(f.lifecycle.handle(&d).await.unwrap(), ProcessOutcome::AlreadyHandled);
        assert_eq!(fetcher.call_count("https://example.com"), 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_process_once() {
        let fetcher = MockFetcher::new()
            .with_page("https://example.com", PAGE)
            .with_delay(Duration::from_millis(20));
        let f = fixture(fetcher.clone());
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        let d = delivery(&job.job_id, "https://example.com", 1);

        let (a, b) = tokio::join!(f.lifecycle.handle(&d), f.lifecycle.handle(&d));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes.iter().filter(|o| **o == ProcessOutcome::Completed).count(),
            1
        );
        assert_eq!(fetcher.call_count("https://example.com"), 1);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let f = fixture(MockFetcher::new().with_error(
            "https://example.com/missing",
            FetchError::Http {
                url: "https://example.com/missing".into(),
                status: 404,
            },
        ));
        let job = f.lifecycle.submit("https://example.com/missing").await.unwrap();

        let outcome = f
            .lifecycle
            .handle(&delivery(&job.job_id, "https://example.com/missing", 1))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));

        let view = f.lifecycle.status(job.job_id.as_str()).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error_type, Some(FailureType::HttpError));
        assert_eq!(view.http_status_code, Some(404));
    }

    #[tokio::test]
    async fn retryable_errors_go_back_to_the_queue_and_release_the_job() {
        let f = fixture(MockFetcher::new().with_error(
            "https://example.com",
            FetchError::Http {
                url: "https://example.com".into(),
                status: 503,
            },
        ));
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        let d = delivery(&job.job_id, "https://example.com", 1);

        let err = f.lifecycle.handle(&d).await.unwrap_err();
        assert!(matches!(err, ProcessError::Retryable(_)));
        let stored = f.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);

        f.lifecycle.on_retry(&d).await.unwrap();
        let stored = f.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn failed_release_is_recovered_after_lease_expiry() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::new(QueueSettings {
            lease: Duration::from_millis(10),
            ..Default::default()
        }));
        let fetcher = MockFetcher::new()
            .with_error(
                "https://example.com",
                FetchError::Http {
                    url: "https://example.com".into(),
                    status: 503,
                },
            )
            .with_page("https://example.com", PAGE);
        let lifecycle = JobLifecycle::new(store.clone(), queue.clone(), Arc::new(fetcher));
        let job = lifecycle.submit("https://example.com").await.unwrap();

        let first = queue.claim("worker-a", 1).await.unwrap().remove(0);
        assert!(lifecycle.handle(&first).await.is_err());
        store.fail_next(1);
        assert!(lifecycle.on_retry(&first).await.is_err());
        let stored = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);

        // The item is not handed back, so it comes round again as recovered.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stalled = queue.reap_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        let second = queue.claim("worker-b", 1).await.unwrap().remove(0);
        assert!(second.recovered);
        assert_eq!(second.attempt, 2);

        assert_eq!(lifecycle.handle(&second).await.unwrap(), ProcessOutcome::Completed);
        let stored = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stalled_worker_cannot_overwrite_recovered_outcome() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::new(QueueSettings {
            lease: Duration::from_millis(10),
            ..Default::default()
        }));
        // The stalled worker sees a slow site that eventually 404s.
        let stalled = JobLifecycle::new(
            store.clone(),
            queue.clone(),
            Arc::new(
                MockFetcher::new()
                    .with_error(
                        "https://example.com",
                        FetchError::Http {
                            url: "https://example.com".into(),
                            status: 404,
                        },
                    )
                    .with_delay(Duration::from_millis(150)),
            ),
        );
        let recovering = JobLifecycle::new(
            store.clone(),
            queue.clone(),
            Arc::new(MockFetcher::new().with_page("https://example.com", PAGE)),
        );
        let job = recovering.submit("https://example.com").await.unwrap();

        let first = queue.claim("worker-a", 1).await.unwrap().remove(0);
        let slow = tokio::spawn(async move { stalled.handle(&first).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.reap_stalled().await.unwrap().len(), 1);
        let second = queue.claim("worker-b", 1).await.unwrap().remove(0);
        assert!(second.recovered);
        assert_eq!(
            recovering.handle(&second).await.unwrap(),
            ProcessOutcome::Completed
        );

        assert_eq!(slow.await.unwrap().unwrap(), ProcessOutcome::AlreadyHandled);
        let stored = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.error.is_none());
        assert_eq!(stored.results.unwrap()["title"], json!("Example Domain"));
    }

    #[tokio::test]
    async fn exhaustion_fails_job_with_retry_message() {
        let f = fixture(MockFetcher::new());
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        let d = delivery(&job.job_id, "https://example.com", 3);

        f.lifecycle.on_exhausted(&d, "HTTP 503").await;
        let view = f.lifecycle.status(job.job_id.as_str()).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some(RETRIES_EXHAUSTED_MESSAGE));
        assert_eq!(view.error_type, Some(FailureType::RetriesExhausted));
    }

    #[tokio::test]
    async fn recovered_delivery_reclaims_processing_job() {
        let f = fixture(MockFetcher::new().with_page("https://example.com", PAGE));
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        f.store
            .update_if_pending(&job.job_id, &JobPatch::processing())
            .await
            .unwrap();

        let mut d = delivery(&job.job_id, "https://example.com", 2);
        assert_eq!(f.lifecycle.handle(&d).await.unwrap(), ProcessOutcome::AlreadyHandled);

        d.recovered = true;
        assert_eq!(f.lifecycle.handle(&d).await.unwrap(), ProcessOutcome::Completed);
    }

    #[tokio::test]
    async fn status_rejects_malformed_ids() {
        let f = fixture(MockFetcher::new());
        for raw in ["12345", "abcd567890123456789"] {
            let err = f.lifecycle.status(raw).await.unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidFormat(_)), "{raw}");
        }
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let f = fixture(MockFetcher::new());
        let err = f.lifecycle.status("1700000000000000001").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[tokio::test]
    async fn waiting_job_is_presented_as_processing() {
        let f = fixture(MockFetcher::new());
        let first = f.lifecycle.submit("https://example.com/a").await.unwrap();
        let view = f.lifecycle.status(first.job_id.as_str()).await.unwrap();
        assert_eq!(view.status, JobStatus::Processing);
        assert_eq!(view.queue_position, Some(1));

        // Presentation only; the stored record is untouched.
        let stored = f.store.get(&first.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn pending_job_without_queue_entry_stays_pending() {
        let f = fixture(MockFetcher::new());
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        f.queue.remove(&job.job_id).await.unwrap();

        let view = f.lifecycle.status(job.job_id.as_str()).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.queue_position, None);
    }

    #[tokio::test]
    async fn failed_job_without_message_gets_default() {
        let f = fixture(MockFetcher::new());
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        f.store
            .update(
                &job.job_id,
                &JobPatch {
                    status: Some(JobStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let view = f.lifecycle.status(job.job_id.as_str()).await.unwrap();
        assert_eq!(view.error.as_deref(), Some(DEFAULT_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn unknown_stored_status_is_an_error() {
        let f = fixture(MockFetcher::new());
        let job = f.lifecycle.submit("https://example.com").await.unwrap();
        f.store
            .update(
                &job.job_id,
                &JobPatch {
                    status: Some(JobStatus::Unrecognized("ARCHIVED".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = f.lifecycle.status(job.job_id.as_str()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownStatus { .. }));
    }
}
