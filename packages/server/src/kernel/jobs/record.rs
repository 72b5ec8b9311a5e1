//! Job record model and partial-update patches.

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::JobId;

// ============================================================================
// Enums
// ============================================================================

/// Stored lifecycle status of a job.
///
/// `Unrecognized` holds any value read back from storage that is not one of
/// the four known states. It is never written by this crate; the read side
/// reports it as a data-integrity error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Unrecognized(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Unrecognized(raw) => raw,
        }
    }

    /// COMPLETED and FAILED records are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<String> for JobStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "PENDING" => JobStatus::Pending,
            "PROCESSING" => JobStatus::Processing,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            _ => JobStatus::Unrecognized(raw),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a terminal failure, exposed to clients as `error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    NetworkError,
    Timeout,
    HttpError,
    DnsError,
    TlsError,
    RedirectLoop,
    BlockedUrl,
    ParseError,
    QueueError,
    RetriesExhausted,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::NetworkError => "NETWORK_ERROR",
            FailureType::Timeout => "TIMEOUT",
            FailureType::HttpError => "HTTP_ERROR",
            FailureType::DnsError => "DNS_ERROR",
            FailureType::TlsError => "TLS_ERROR",
            FailureType::RedirectLoop => "REDIRECT_LOOP",
            FailureType::BlockedUrl => "BLOCKED_URL",
            FailureType::ParseError => "PARSE_ERROR",
            FailureType::QueueError => "QUEUE_ERROR",
            FailureType::RetriesExhausted => "RETRIES_EXHAUSTED",
        }
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NETWORK_ERROR" => FailureType::NetworkError,
            "TIMEOUT" => FailureType::Timeout,
            "HTTP_ERROR" => FailureType::HttpError,
            "DNS_ERROR" => FailureType::DnsError,
            "TLS_ERROR" => FailureType::TlsError,
            "REDIRECT_LOOP" => FailureType::RedirectLoop,
            "BLOCKED_URL" => FailureType::BlockedUrl,
            "PARSE_ERROR" => FailureType::ParseError,
            "QUEUE_ERROR" => FailureType::QueueError,
            "RETRIES_EXHAUSTED" => FailureType::RetriesExhausted,
            other => return Err(format!("unknown failure type: {other}")),
        })
    }
}

impl Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Record
// ============================================================================

/// Durable state of one analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub results: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<FailureType>,
    pub http_status_code: Option<u16>,
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn pending(job_id: JobId, url: impl Into<String>) -> Self {
        let created_at = job_id.created_at();
        Self {
            job_id,
            url: url.into(),
            status: JobStatus::Pending,
            created_at,
            updated_at: None,
            results: None,
            error: None,
            error_type: None,
            http_status_code: None,
        }
    }

    /// Merge `patch` into this record.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) {
        if let Some(status) = &patch.status {
            self.status = status.clone();
        }
        if let Some(results) = &patch.results {
            self.results = Some(results.clone());
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(error_type) = patch.error_type {
            self.error_type = Some(error_type);
        }
        if let Some(code) = patch.http_status_code {
            self.http_status_code = Some(code);
        }
        self.updated_at = Some(now);
    }

    /// Most recent write, falling back to creation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

/// Fields to merge into a stored record. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub results: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<FailureType>,
    pub http_status_code: Option<u16>,
}

impl JobPatch {
    pub fn processing() -> Self {
        Self {
            status: Some(JobStatus::Processing),
            ..Default::default()
        }
    }

    /// Back to the wait line after a retryable failure.
    pub fn requeued() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            ..Default::default()
        }
    }

    pub fn completed(results: serde_json::Value, http_status_code: u16) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            results: Some(results),
            http_status_code: Some(http_status_code),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, error_type: FailureType) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            error_type: Some(error_type),
            ..Default::default()
        }
    }

    pub fn with_http_status(mut self, code: Option<u16>) -> Self {
        self.http_status_code = code;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id() -> JobId {
        JobId::parse("1700000000000123456").unwrap()
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from(String::from(status.clone())), status);
        }
        assert_eq!(
            JobStatus::from("ARCHIVED".to_string()),
            JobStatus::Unrecognized("ARCHIVED".to_string())
        );
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"PROCESSING\""
        );
        let status: JobStatus = serde_json::from_str("\"weird\"").unwrap();
        assert_eq!(status, JobStatus::Unrecognized("weird".into()));
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn failure_type_parses_its_own_names() {
        for ty in [
            FailureType::NetworkError,
            FailureType::Timeout,
            FailureType::HttpError,
            FailureType::ParseError,
            FailureType::RetriesExhausted,
        ] {
            assert_eq!(ty.as_str().parse::<FailureType>(), Ok(ty));
            assert_eq!(
                serde_json::to_string(&ty).unwrap(),
                format!("\"{}\"", ty.as_str())
            );
        }
        assert!("NOPE".parse::<FailureType>().is_err());
    }

    #[test]
    fn pending_record_takes_creation_time_from_id() {
        let record = JobRecord::pending(job_id(), "https://example.com");
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.created_at.timestamp_millis(), 1_700_000_000_000);
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let mut record = JobRecord::pending(job_id(), "https://example.com");
        let now = Utc::now();
        record.apply(
            &JobPatch::completed(serde_json::json!({"title": "x"}), 200),
            now,
        );

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.http_status_code, Some(200));
        assert!(record.error.is_none());
        assert_eq!(record.updated_at, Some(now));
        assert_eq!(record.url, "https://example.com");
        assert_eq!(record.last_activity(), now);
    }
}
