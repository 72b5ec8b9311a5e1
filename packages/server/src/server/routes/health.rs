use std::future::Future;
use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    storage: ComponentHealth,
    queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

async fn check<E, F>(ping: F) -> ComponentHealth
where
    E: std::fmt::Display,
    F: Future<Output = Result<(), E>>,
{
    match tokio::time::timeout(CHECK_TIMEOUT, ping).await {
        Ok(Ok(())) => ComponentHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => ComponentHealth {
            status: "error".to_string(),
            error: Some(e.to_string()),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            error: Some(format!("Check timeout (>{}s)", CHECK_TIMEOUT.as_secs())),
        },
    }
}

/// Health check endpoint
///
/// Returns 200 OK when both the job store and the work queue answer,
/// 503 Service Unavailable otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let storage = check(state.lifecycle.store().ping()).await;
    let queue = check(state.lifecycle.queue().ping()).await;

    let is_healthy = storage.is_ok() && queue.is_ok();
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            storage,
            queue,
        }),
    )
}
