use axum::{
    extract::{Extension, Path},
    Json,
};

use crate::kernel::jobs::JobView;
use crate::server::app::AppState;
use crate::server::error::ApiError;

/// Current status of a job, with results or error once it has finished.
pub async fn results_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let view = state.lifecycle.status(&job_id).await?;
    Ok(Json(view))
}
