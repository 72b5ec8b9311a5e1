//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the extraction library
//! without making real network calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FetchError, FetchResult};
use crate::fetcher::{FetchedPage, Fetcher};

/// A scripted fetcher for tests.
///
/// Responses are queued per URL and consumed in order; once a URL's queue
/// holds a single entry that entry is repeated. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: Arc<RwLock<HashMap<String, VecDeque<FetchResult<FetchedPage>>>>>,
    calls: Arc<RwLock<Vec<String>>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch, to simulate slow sites.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serve `html` with status 200 for `url`.
    pub fn with_page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        let url = url.into();
        let page = FetchedPage {
            url: url.clone(),
            html: html.into(),
            status_code: 200,
            content_type: Some("text/html; charset=utf-8".to_string()),
        };
        self.push(url, Ok(page));
        self
    }

    /// Fail the next fetch of `url` with `error`.
    pub fn with_error(self, url: impl Into<String>, error: FetchError) -> Self {
        self.push(url.into(), Err(error));
        self
    }

    /// Queue a response for `url`.
    pub fn push(&self, url: String, response: FetchResult<FetchedPage>) {
        if let Ok(mut responses) = self.responses.write() {
            responses.entry(url).or_default().push_back(response);
        }
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of fetches of `url`.
    pub fn call_count(&self, url: &str) -> usize {
        self.calls().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<FetchedPage> {
        if let Ok(mut calls) = self.calls.write() {
            calls.push(url.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut responses = match self.responses.write() {
            Ok(responses) => responses,
            Err(_) => {
                return Err(FetchError::Request {
                    url: url.to_string(),
                    message: "mock poisoned".to_string(),
                })
            }
        };
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| not_found(url)),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| not_found(url)),
            None => not_found(url),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn not_found(url: &str) -> FetchResult<FetchedPage> {
    Err(FetchError::Http {
        url: url.to_string(),
        status: 404,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_scripted_responses_in_order() {
        let url = "https://example.com";
        let fetcher = MockFetcher::new()
            .with_error(
                url,
                FetchError::Http {
                    url: url.into(),
                    status: 503,
                },
            )
            .with_page(url, "<html></html>");

        assert!(fetcher.fetch(url).await.is_err());
        assert!(fetcher.fetch(url).await.is_ok());
        // Last response repeats
        assert!(fetcher.fetch(url).await.is_ok());
        assert_eq!(fetcher.call_count(url), 3);
    }

    #[tokio::test]
    async fn unknown_urls_are_not_found() {
        let err = MockFetcher::new()
            .fetch("https://nowhere.example")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }
}
