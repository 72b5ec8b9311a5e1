//! Application setup and router configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::{CleanupSweeper, JobLifecycle};
use crate::kernel::ServerDeps;
use crate::server::routes::{
    analyse_handler, cleanup_run_handler, cleanup_stats_handler, health_handler, results_handler,
};

/// Request bodies carry a single URL.
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<JobLifecycle>,
    pub sweeper: Arc<CleanupSweeper>,
}

impl From<&ServerDeps> for AppState {
    fn from(deps: &ServerDeps) -> Self {
        Self {
            lifecycle: deps.lifecycle.clone(),
            sweeper: deps.sweeper.clone(),
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    // No configured origins: allow any (development)
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/analyse", post(analyse_handler))
        .route("/api/results/:job_id", get(results_handler))
        .route(
            "/api/admin/cleanup",
            get(cleanup_stats_handler).post(cleanup_run_handler),
        )
        // Health check
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}
