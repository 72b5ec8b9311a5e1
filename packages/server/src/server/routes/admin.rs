use axum::{extract::Extension, Json};

use crate::kernel::jobs::{SweepReport, SweepStats};
use crate::server::app::AppState;

/// Cleanup sweeper totals since startup.
pub async fn cleanup_stats_handler(Extension(state): Extension<AppState>) -> Json<SweepStats> {
    Json(state.sweeper.stats().await)
}

/// Run a cleanup sweep now and return what it did.
pub async fn cleanup_run_handler(Extension(state): Extension<AppState>) -> Json<SweepReport> {
    tracing::info!("cleanup sweep requested");
    Json(state.sweeper.run_once().await)
}
