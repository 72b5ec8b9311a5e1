//! Page fetching and metadata extraction for the analysis pipeline.
//!
//! The library is deliberately small and side-effect free apart from the
//! network fetch itself:
//!
//! # Usage
//!
//! ```rust,ignore
//! use extraction::{Fetcher, FetcherConfig, HttpFetcher, MetadataParser, UrlValidator};
//!
//! let validator = UrlValidator::new();
//! let url = validator.validate("https://example.com")?;
//!
//! let fetcher = HttpFetcher::new(FetcherConfig::default(), validator)?;
//! let page = fetcher.fetch(url.as_str()).await?;
//!
//! let metadata = MetadataParser::new().parse(&page.html, &page.url);
//! ```
//!
//! # Modules
//!
//! - [`validator`] - SSRF protection for submitted URLs
//! - [`fetcher`] - HTTP fetching with retryable/permanent failure classification
//! - [`parser`] - HTML metadata extraction
//! - [`testing`] - Mock implementations for testing

pub mod error;
pub mod fetcher;
pub mod parser;
pub mod testing;
pub mod validator;

// Re-export core types at crate root
pub use error::{FetchError, FetchResult, ValidationError, ValidationResult};
pub use fetcher::{FetchedPage, Fetcher, FetcherConfig, HttpFetcher};
pub use parser::{Headings, LinkStats, MetadataParser, PageMetadata};
pub use testing::MockFetcher;
pub use validator::{UrlCheck, UrlValidator, MAX_URL_LENGTH};
