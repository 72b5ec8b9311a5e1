//! HTTP error responses.
//!
//! Every error body is `{"error": "<message>"}`; validation failures add a
//! `details` field with the validator's reason.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::kernel::jobs::LifecycleError;

pub const STORAGE_UNAVAILABLE: &str = "Storage system is unavailable";
pub const QUEUE_UNAVAILABLE: &str = "Queue system is unavailable";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                details: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>, details: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::BAD_REQUEST, message);
        err.body.details = Some(details.into());
        err
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match &err {
            LifecycleError::Validation(e) => ApiError::bad_request("Invalid URL", e.to_string()),
            LifecycleError::InvalidFormat(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "Invalid job ID format")
            }
            LifecycleError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "Job not found"),
            LifecycleError::StorageUnavailable(e) => {
                warn!(error = %e, "storage unavailable");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, STORAGE_UNAVAILABLE)
            }
            LifecycleError::QueueUnavailable(e) => {
                warn!(error = %e, "queue unavailable");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, QUEUE_UNAVAILABLE)
            }
            LifecycleError::UnknownStatus { job_id, status } => {
                error!(job_id = %job_id, status = %status, "job record has unknown status");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Unknown job status")
            }
            LifecycleError::Internal(message) => {
                error!(error = %message, "internal error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
