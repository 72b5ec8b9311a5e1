//! End-to-end tests for the analysis API over in-memory backends.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::*;
use extraction::{FetchError, MockFetcher};
use regex::Regex;
use serde_json::json;
use server_core::common::JobId;
use server_core::kernel::jobs::{JobStore, WorkQueue};

fn example_app() -> TestApp {
    TestApp::new(MockFetcher::new().with_page(EXAMPLE_URL, EXAMPLE_PAGE))
}

// =============================================================================
// Submission
// =============================================================================

#[tokio::test]
async fn submit_returns_accepted_with_numeric_job_id() {
    let app = example_app();

    let response = app.api.analyse(EXAMPLE_URL).await;

    assert_eq!(response.status, StatusCode::ACCEPTED);
    let id_pattern = Regex::new(r"^\d{19}$").unwrap();
    assert!(id_pattern.is_match(response.str("job_id")), "{:?}", response.body);
    assert_eq!(response.str("status"), "PENDING");
    assert!(!response.str("message").is_empty());
}

#[tokio::test]
async fn status_right_after_submit_is_never_not_found() {
    let app = example_app();
    let job_id = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();

    let response = app.api.results(&job_id).await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(matches!(response.str("status"), "PENDING" | "PROCESSING"));
    assert_eq!(response.str("url"), EXAMPLE_URL);
}

#[tokio::test]
async fn submitted_job_eventually_completes_with_metadata() {
    let app = example_app();
    let job_id = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();

    let body = app.run_until_finished(&job_id).await;

    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["http_status_code"], 200);
    assert_eq!(body["results"]["title"], "Example Domain");
    assert!(body.get("error").is_none());
    assert_eq!(app.fetcher.call_count(EXAMPLE_URL), 1);
}

#[tokio::test]
async fn private_url_is_rejected_without_creating_a_job() {
    let app = example_app();

    let response = app.api.analyse("http://localhost:3000").await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.str("error"), "Invalid URL");
    let details = response.str("details").to_lowercase();
    assert!(details.contains("invalid url") && details.contains("private"), "{details}");
    assert!(app.store.is_empty().await);
    assert!(app.queue.is_empty().await);
}

#[tokio::test]
async fn non_http_scheme_is_rejected() {
    let app = example_app();

    let response = app.api.analyse("ftp://example.com/file").await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_url_is_rejected() {
    let app = example_app();

    let response = app.api.post_json("/api/analyse", json!({})).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = app.api.post_raw("/api/analyse", "{not json").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.str("error"), "Invalid request body");
}

#[tokio::test]
async fn storage_outage_returns_503_and_queues_nothing() {
    let app = example_app();
    app.store.set_offline(true);

    let response = app.api.analyse(EXAMPLE_URL).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body, json!({ "error": "Storage system is unavailable" }));
    assert!(app.queue.is_empty().await);
}

#[tokio::test]
async fn queue_outage_after_store_fails_the_job() {
    let app = example_app();
    app.queue.set_offline(true);

    let response = app.api.analyse(EXAMPLE_URL).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    app.queue.set_offline(false);

    // The record was stored before the queue refused it
    let jobs = app
        .store
        .find_stale(
            &[server_core::kernel::jobs::JobStatus::Failed],
            chrono::Utc::now() + chrono::Duration::seconds(1),
            10,
        )
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);

    let status = app.api.results(jobs[0].job_id.as_str()).await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.str("status"), "FAILED");
    assert_eq!(status.str("error"), "Failed to queue job");
}

// =============================================================================
// Status queries
// =============================================================================

#[tokio::test]
async fn malformed_job_ids_are_rejected() {
    let app = example_app();

    for bad in ["12345", "abcd567890123456789"] {
        let response = app.api.results(bad).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{bad}");
        assert_eq!(response.str("error"), "Invalid job ID format");
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = example_app();

    let response = app.api.results("1700000000000000001").await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.str("error"), "Job not found");
}

#[tokio::test]
async fn storage_outage_on_read_returns_503() {
    let app = example_app();
    let job_id = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();
    app.store.set_offline(true);

    let response = app.api.results(&job_id).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.str("error"), "Storage system is unavailable");
}

#[tokio::test]
async fn queued_job_reports_position_and_estimated_wait() {
    let app = example_app();
    let first = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();
    let second = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();

    let response = app.api.results(&second).await;

    // Waiting in line is presented as PROCESSING
    assert_eq!(response.str("status"), "PROCESSING");
    assert_eq!(response.body["queue_position"], 2);
    assert!(response.body["estimated_wait_ms"].as_u64().unwrap() > 0);

    // Stored status is untouched by the read
    let stored = app
        .store
        .get(&JobId::parse(&first).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status.as_str(), "PENDING");
}

// =============================================================================
// Processing failures
// =============================================================================

#[tokio::test]
async fn client_error_fails_without_retry() {
    let url = "https://example.com/missing";
    let app = TestApp::new(MockFetcher::new());
    let job_id = app.api.analyse(url).await.str("job_id").to_string();

    let body = app.run_until_finished(&job_id).await;

    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["error_type"], "HTTP_ERROR");
    assert_eq!(body["http_status_code"], 404);
    assert_eq!(app.fetcher.call_count(url), 1);
}

#[tokio::test]
async fn server_error_is_retried_then_completes() {
    let fetcher = MockFetcher::new()
        .with_error(
            EXAMPLE_URL,
            FetchError::Http {
                url: EXAMPLE_URL.to_string(),
                status: 503,
            },
        )
        .with_page(EXAMPLE_URL, EXAMPLE_PAGE);
    let app = TestApp::new(fetcher);
    let job_id = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();

    let body = app.run_until_finished(&job_id).await;

    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(app.fetcher.call_count(EXAMPLE_URL), 2);
}

#[tokio::test]
async fn persistent_timeouts_exhaust_retries() {
    let timeout = FetchError::Timeout {
        url: EXAMPLE_URL.to_string(),
    };
    let app = TestApp::new(MockFetcher::new().with_error(EXAMPLE_URL, timeout));
    let job_id = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();

    let body = app.run_until_finished(&job_id).await;

    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["error"], "exceeded retry attempts");
    assert_eq!(body["error_type"], "RETRIES_EXHAUSTED");
    assert_eq!(
        app.fetcher.call_count(EXAMPLE_URL) as u32,
        app.config.queue_max_attempts
    );
}

// =============================================================================
// Cleanup and health
// =============================================================================

#[tokio::test]
async fn lost_job_is_failed_by_forced_cleanup() {
    let config = server_core::Config {
        cleanup_stale_pending: Duration::ZERO,
        ..test_config()
    };
    let app = TestApp::with_config(MockFetcher::new(), config);
    let job_id = app.api.analyse(EXAMPLE_URL).await.str("job_id").to_string();

    // Simulate the queue losing the item
    assert!(app.queue.remove(&JobId::parse(&job_id).unwrap()).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = app.api.post_json("/api/admin/cleanup", json!({})).await;
    assert_eq!(report.status, StatusCode::OK);
    assert_eq!(report.body["orphaned_failed"], 1);

    let status = app.api.results(&job_id).await;
    assert_eq!(status.str("status"), "FAILED");
    assert_eq!(status.str("error_type"), "TIMEOUT");

    let stats = app.api.get("/api/admin/cleanup").await;
    assert_eq!(stats.body["runs"], 1);
    assert_eq!(stats.body["orphaned_failed"], 1);
}

#[tokio::test]
async fn health_reflects_backend_reachability() {
    let app = example_app();

    let healthy = app.api.get("/health").await;
    assert_eq!(healthy.status, StatusCode::OK);
    assert_eq!(healthy.str("status"), "healthy");

    app.queue.set_offline(true);
    let unhealthy = app.api.get("/health").await;
    assert_eq!(unhealthy.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(unhealthy.body["storage"]["status"], "ok");
    assert_eq!(unhealthy.body["queue"]["status"], "error");
}
