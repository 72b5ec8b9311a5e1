//! HTTP page fetching with failure classification.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{FetchError, FetchResult, ValidationError};
use crate::validator::UrlValidator;

/// Largest response body read into memory.
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// A fetched HTML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: String,
    pub html: String,
    pub status_code: u16,
    pub content_type: Option<String>,
}

/// Fetches remote pages.
///
/// Implementations must classify failures through [`FetchError`] so callers
/// can tell transient failures from permanent ones.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResult<FetchedPage>;

    /// Fetcher name (for logging/debugging).
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Overall request timeout (connect + headers + body)
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Resolve each redirect target and check its addresses
    pub resolve_redirects: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            // Use a browser-like User-Agent to avoid bot detection
            user_agent: "Mozilla/5.0 (compatible; PageAnalyser/1.0; +https://example.com/bot)"
                .to_string(),
            resolve_redirects: true,
        }
    }
}

/// Fetcher backed by reqwest.
///
/// Redirects are followed here rather than by reqwest, so every hop is
/// re-validated against the [`UrlValidator`] (including its resolved
/// addresses) and a public URL cannot bounce the request into a private
/// network.
pub struct HttpFetcher {
    client: reqwest::Client,
    validator: UrlValidator,
    resolve_redirects: bool,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig, validator: UrlValidator) -> FetchResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            validator,
            resolve_redirects: config.resolve_redirects,
        })
    }

    /// Check a redirect target before following it.
    async fn check_redirect(&self, url: &str, target: &Url) -> FetchResult<()> {
        let checked = if self.resolve_redirects {
            self.validator.validate_with_dns(target.as_str()).await
        } else {
            self.validator.validate(target.as_str())
        };
        checked.map(|_| ()).map_err(|e| match e {
            ValidationError::DnsResolution(message) => FetchError::Dns {
                url: target.to_string(),
                message,
            },
            other => FetchError::BlockedRedirect {
                url: url.to_string(),
                reason: other.to_string(),
            },
        })
    }

    async fn read_body(url: &str, mut response: reqwest::Response) -> FetchResult<String> {
        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = MAX_BODY_BYTES.saturating_sub(body.len());
                    if chunk.len() >= remaining {
                        body.extend_from_slice(&chunk[..remaining]);
                        debug!(url = %url, limit = MAX_BODY_BYTES, "response body truncated");
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return Err(classify_reqwest_error(url, &e)),
            }
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<FetchedPage> {
        debug!(url = %url, "HTTP fetch starting");

        let mut current = url.to_string();
        let mut hops = 0;
        let response = loop {
            let response = self.client.get(&current).send().await.map_err(|e| {
                warn!(url = %current, error = %e, "HTTP request failed");
                classify_reqwest_error(&current, &e)
            })?;

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok());
            let Some(target) = redirect_target(&current, response.status(), location) else {
                break response;
            };

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(FetchError::RedirectLoop {
                    url: url.to_string(),
                });
            }
            self.check_redirect(url, &target).await?;
            debug!(from = %current, to = %target, hop = hops, "following redirect");
            current = target.to_string();
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let html = Self::read_body(url, response).await?;

        debug!(url = %url, status = status.as_u16(), bytes = html.len(), "HTTP fetch complete");

        Ok(FetchedPage {
            url: final_url,
            html,
            status_code: status.as_u16(),
            content_type,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Where a 3xx response points, resolved against the requested URL.
fn redirect_target(current: &str, status: StatusCode, location: Option<&str>) -> Option<Url> {
    if !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
        return None;
    }
    Url::parse(current).ok()?.join(location?).ok()
}

fn classify_reqwest_error(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        return FetchError::Timeout {
            url: url.to_string(),
        };
    }

    if error.is_builder() {
        return FetchError::Request {
            url: url.to_string(),
            message: error.to_string(),
        };
    }

    classify_transport_failure(url, &error_chain(error))
}

/// Classify a transport-level failure from its rendered error chain.
///
/// hyper and rustls do not expose typed DNS/TLS errors through reqwest, so
/// the chain text is the only signal available.
pub fn classify_transport_failure(url: &str, chain: &str) -> FetchError {
    let lower = chain.to_ascii_lowercase();
    let url = url.to_string();
    let message = chain.to_string();

    if lower.contains("dns error")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
        || lower.contains("nodename nor servname")
    {
        FetchError::Dns { url, message }
    } else if lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("ssl")
        || lower.contains("handshake")
    {
        FetchError::Tls { url, message }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FetchError::Timeout { url }
    } else {
        FetchError::Connection { url, message }
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts.join(": ")
}
