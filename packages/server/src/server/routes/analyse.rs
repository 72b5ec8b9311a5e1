use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::JobId;
use crate::kernel::jobs::JobStatus;
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct AnalyseRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyseResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

/// Accept a URL for analysis.
///
/// Responds 202 once the job is stored and queued; the result is fetched
/// later from `/api/results/:job_id`.
pub async fn analyse_handler(
    Extension(state): Extension<AppState>,
    body: Result<Json<AnalyseRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AnalyseResponse>), ApiError> {
    let Json(request) =
        body.map_err(|e| ApiError::bad_request("Invalid request body", e.body_text()))?;

    let submission = state.lifecycle.submit(&request.url).await?;
    info!(job_id = %submission.job_id, url = %submission.url, "analysis job accepted");

    let message = format!(
        "Analysis started. Poll /api/results/{} for the outcome.",
        submission.job_id
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyseResponse {
            job_id: submission.job_id,
            status: submission.status,
            message,
        }),
    ))
}
