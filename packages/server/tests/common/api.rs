//! HTTP client for integration testing.
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`, so no
//! socket is bound.

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use server_core::kernel::ServerDeps;
use server_core::server::{build_app, AppState};
use tower::ServiceExt;

/// Client for executing requests against the application router.
#[derive(Clone)]
pub struct ApiClient {
    router: Router,
}

/// Status and decoded JSON body of a response.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    /// Gets a string field, or "" when absent.
    pub fn str(&self, key: &str) -> &str {
        self.body[key].as_str().unwrap_or_default()
    }
}

impl ApiClient {
    pub fn new(deps: &ServerDeps) -> Self {
        Self {
            router: build_app(AppState::from(deps), &[]),
        }
    }

    pub async fn get(&self, path: &str) -> ApiResponse {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> ApiResponse {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn post_raw(&self, path: &str, body: &'static str) -> ApiResponse {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    /// Submit a URL for analysis.
    pub async fn analyse(&self, url: &str) -> ApiResponse {
        self.post_json("/api/analyse", serde_json::json!({ "url": url }))
            .await
    }

    /// Fetch the status of a job.
    pub async fn results(&self, job_id: &str) -> ApiResponse {
        self.get(&format!("/api/results/{job_id}")).await
    }

    async fn send(&self, request: Request<Body>) -> ApiResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        ApiResponse { status, body }
    }
}
