//! Test fixtures: sample pages and an in-memory application.

use std::sync::Arc;
use std::time::Duration;

use extraction::MockFetcher;
use server_core::kernel::jobs::{MemoryJobStore, MemoryWorkQueue, QueueWorker};
use server_core::kernel::{queue_settings, ServerDeps};
use server_core::Config;

use super::ApiClient;

pub const EXAMPLE_URL: &str = "https://example.com";

pub const EXAMPLE_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
    <title>Example Domain</title>
    <meta name="description" content="This domain is for use in illustrative examples.">
    <meta property="og:title" content="Example">
    <link rel="canonical" href="/">
</head>
<body>
    <h1>Example Domain</h1>
    <p>This domain is for use in illustrative examples in documents.</p>
    <a href="https://www.iana.org/domains/example">More information...</a>
</body>
</html>"#;

/// Configuration tuned for fast tests: no DNS lookups, short backoff.
pub fn test_config() -> Config {
    Config {
        dns_check: false,
        queue_backoff_base: Duration::from_millis(10),
        queue_poll_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

/// The application wired to in-memory backends and a scripted fetcher.
pub struct TestApp {
    pub config: Config,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub fetcher: MockFetcher,
    pub deps: ServerDeps,
    pub worker: QueueWorker,
    pub api: ApiClient,
}

impl TestApp {
    pub fn new(fetcher: MockFetcher) -> Self {
        Self::with_config(fetcher, test_config())
    }

    pub fn with_config(fetcher: MockFetcher, config: Config) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryJobStore::with_ttl(config.job_ttl));
        let queue = Arc::new(MemoryWorkQueue::new(queue_settings(&config)));
        let deps = ServerDeps::new(
            store.clone(),
            queue.clone(),
            Arc::new(fetcher.clone()),
            &config,
        );
        let worker = deps.worker(&config);
        let api = ApiClient::new(&deps);

        Self {
            config,
            store,
            queue,
            fetcher,
            deps,
            worker,
            api,
        }
    }

    /// Run the worker until the job reaches a terminal status, returning
    /// the final status body.
    pub async fn run_until_finished(&self, job_id: &str) -> serde_json::Value {
        for _ in 0..200 {
            self.worker.run_once().await.unwrap();
            let response = self.api.results(job_id).await;
            let status = response.str("status");
            if status == "COMPLETED" || status == "FAILED" {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }
}
