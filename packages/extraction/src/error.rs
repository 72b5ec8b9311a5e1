//! Typed errors for the extraction library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can make
//! retry decisions on the variant rather than on message text.

use thiserror::Error;

/// Reasons a submitted URL is rejected before any network access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Empty or whitespace-only input
    #[error("URL is required")]
    Empty,

    /// Input longer than the accepted maximum
    #[error("URL exceeds maximum length of {max} characters")]
    TooLong { max: usize },

    /// URL parsing failed
    #[error("invalid URL format: {0}")]
    Malformed(String),

    /// URL scheme not allowed (e.g., file://, ftp://)
    #[error("invalid URL scheme '{0}': only http and https are allowed")]
    DisallowedScheme(String),

    /// URL has no host
    #[error("invalid URL: no host")]
    NoHost,

    /// Host is blocked (e.g., localhost, metadata services)
    #[error("invalid URL: private or internal host '{0}' is not allowed")]
    BlockedHost(String),

    /// IP in blocked CIDR range (e.g., 10.0.0.0/8)
    #[error("invalid URL: private or reserved address '{0}' is not allowed")]
    BlockedAddress(String),

    /// DNS resolution failed while checking the resolved addresses
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),
}

/// Failures while fetching a remote page.
///
/// Every variant is classified as retryable or not; the job pipeline only
/// hands retryable failures back to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Non-success HTTP status
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Request or body read timed out
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Connection refused, reset or closed early
    #[error("connection error fetching {url}: {message}")]
    Connection { url: String, message: String },

    /// Host name could not be resolved
    #[error("DNS lookup failed for {url}: {message}")]
    Dns { url: String, message: String },

    /// TLS handshake or certificate failure
    #[error("TLS error fetching {url}: {message}")]
    Tls { url: String, message: String },

    /// Redirect chain too long or cyclic
    #[error("too many redirects fetching {url}")]
    RedirectLoop { url: String },

    /// A redirect pointed at an address the validator rejects
    #[error("redirect to blocked URL from {url}: {reason}")]
    BlockedRedirect { url: String, reason: String },

    /// Request could not be built or sent for a non-transient reason
    #[error("request failed for {url}: {message}")]
    Request { url: String, message: String },
}

impl FetchError {
    /// Whether a later attempt could reasonably succeed.
    ///
    /// 5xx, 429, timeouts and connection errors are transient. Everything else
    /// (4xx, DNS, TLS, redirect problems) is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            FetchError::Timeout { .. } | FetchError::Connection { .. } => true,
            FetchError::Dns { .. }
            | FetchError::Tls { .. }
            | FetchError::RedirectLoop { .. }
            | FetchError::BlockedRedirect { .. }
            | FetchError::Request { .. } => false,
        }
    }

    /// HTTP status carried by the failure, if the server answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for validation.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;
