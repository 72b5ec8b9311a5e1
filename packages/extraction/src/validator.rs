//! URL validation for SSRF protection.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::Serialize;
use url::{Host, Url};

use crate::error::{ValidationError, ValidationResult};

/// Longest URL accepted for analysis.
pub const MAX_URL_LENGTH: usize = 2048;

/// Outcome of [`UrlValidator::check`], shaped for API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// URL validator for SSRF protection.
///
/// Validates URLs before fetching to prevent:
/// - Access to internal services (localhost, 127.0.0.1)
/// - Access to private IP ranges (10.x, 172.16.x, 192.168.x)
/// - Access to cloud metadata services (169.254.x)
/// - Non-HTTP(S) schemes (file://, ftp://)
/// - Overlong input
#[derive(Debug, Clone)]
pub struct UrlValidator {
    /// Allowed URL schemes
    allowed_schemes: HashSet<String>,

    /// Blocked hostnames
    blocked_hosts: HashSet<String>,

    /// Blocked CIDR ranges
    blocked_cidrs: Vec<ipnet::IpNet>,

    /// Additional allowed hosts (bypass normal validation)
    allowed_hosts: HashSet<String>,

    max_length: usize,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlValidator {
    /// Create a new URL validator with default security rules.
    pub fn new() -> Self {
        let blocked_cidrs = [
            "0.0.0.0/8",
            "10.0.0.0/8",
            "100.64.0.0/10", // Carrier-grade NAT
            "127.0.0.0/8",   // Loopback
            "169.254.0.0/16", // Link-local / cloud metadata
            "172.16.0.0/12",
            "192.0.0.0/24", // IETF protocol assignments
            "192.0.2.0/24", // TEST-NET-1
            "192.168.0.0/16",
            "198.18.0.0/15", // Benchmarking
            "198.51.100.0/24", // TEST-NET-2
            "203.0.113.0/24", // TEST-NET-3
            "224.0.0.0/4",  // Multicast
            "240.0.0.0/4",  // Reserved
            "255.255.255.255/32",
            "::/96",     // Unspecified, loopback, IPv4-compatible
            "::ffff:0:0/96", // IPv4-mapped
            "64:ff9b::/96",  // NAT64
            "64:ff9b:1::/48",
            "100::/64",      // Discard-only
            "2001:db8::/32", // Documentation
            "fc00::/7",  // IPv6 private
            "fe80::/10", // IPv6 link-local
            "ff00::/8",  // IPv6 multicast
        ]
        .into_iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect();

        Self {
            allowed_schemes: ["http", "https"].into_iter().map(String::from).collect(),
            blocked_hosts: [
                "localhost",
                "metadata.google.internal",
                "metadata.gke.internal",
                "metadata",
                "instance-data",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_cidrs,
            allowed_hosts: HashSet::new(),
            max_length: MAX_URL_LENGTH,
        }
    }

    /// Add an allowed host (bypasses validation).
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    /// Block an additional host.
    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into());
        self
    }

    /// Block an additional CIDR range.
    pub fn block_cidr(mut self, cidr: ipnet::IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    /// `{valid, error}` view of [`validate`](Self::validate).
    pub fn check(&self, url: &str) -> UrlCheck {
        match self.validate(url) {
            Ok(_) => UrlCheck {
                valid: true,
                error: None,
            },
            Err(e) => UrlCheck {
                valid: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Validate a URL for safety, returning the parsed form.
    pub fn validate(&self, url: &str) -> ValidationResult<Url> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ValidationError::Empty);
        }
        if url.len() > self.max_length {
            return Err(ValidationError::TooLong {
                max: self.max_length,
            });
        }

        let parsed = Url::parse(url).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        if !self.allowed_schemes.contains(parsed.scheme()) {
            return Err(ValidationError::DisallowedScheme(parsed.scheme().to_string()));
        }

        let host = parsed.host().ok_or(ValidationError::NoHost)?;

        match host {
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if self.allowed_hosts.contains(&domain) {
                    return Ok(parsed);
                }
                if self.blocked_hosts.contains(&domain) || domain.ends_with(".localhost") {
                    return Err(ValidationError::BlockedHost(domain));
                }
            }
            Host::Ipv4(ip) => self.check_ip(IpAddr::V4(ip))?,
            Host::Ipv6(ip) => self.check_ip(IpAddr::V6(ip))?,
        }

        Ok(parsed)
    }

    /// Validate a URL and resolve DNS to check the actual IP.
    ///
    /// This catches DNS rebinding attacks where a hostname resolves
    /// to an internal IP.
    pub async fn validate_with_dns(&self, url: &str) -> ValidationResult<Url> {
        let parsed = self.validate(url)?;

        let Some(Host::Domain(host)) = parsed.host() else {
            return Ok(parsed);
        };
        if self.allowed_hosts.contains(host) {
            return Ok(parsed);
        }

        let port = parsed.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ValidationError::DnsResolution(e.to_string()))?;

        for addr in addrs {
            self.check_ip(addr.ip())?;
        }

        Ok(parsed)
    }

    fn check_ip(&self, ip: IpAddr) -> ValidationResult<()> {
        // ::ffff:10.0.0.1 must be judged as 10.0.0.1
        let canonical = ip.to_canonical();
        let blocked = |addr: &IpAddr| {
            addr.is_unspecified() || self.blocked_cidrs.iter().any(|cidr| cidr.contains(addr))
        };
        if blocked(&canonical) || blocked(&ip) {
            return Err(ValidationError::BlockedAddress(canonical.to_string()));
        }
        Ok(())
    }
}
