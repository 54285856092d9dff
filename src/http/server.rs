//! HTTP server hosting the platform routes behind their rate limiters.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::with_rate_limit;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{PolicyName, RateLimiters};

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Named limiters sharing one store
    limiters: Arc<RateLimiters>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiters: Arc<RateLimiters>) -> Self {
        Self { addr, limiters }
    }

    /// Start the server with graceful shutdown.
    ///
    /// Once `signal` resolves and in-flight requests drain, the limiters'
    /// shared store is destroyed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        let app = router(&self.limiters);
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        self.limiters.shutdown().await;

        served.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatekeeperError::Http(e.to_string())
        })
    }
}

/// Build the platform router with each route group behind its policy.
pub fn router(limiters: &RateLimiters) -> Router {
    let auth = Router::new().route("/api/auth/login", post(login));
    let api = Router::new()
        .route("/api/organizations", get(list_organizations))
        .route("/api/memberships", get(list_memberships));
    let public = Router::new().route("/api/content/search", get(search_content));
    let upload = Router::new().route("/api/uploads", post(create_upload));
    let assessment =
        Router::new().route("/api/assessments/:id/responses", post(submit_assessment));

    Router::new()
        .route("/health", get(health))
        .merge(with_rate_limit(auth, limiters.get(PolicyName::Auth)))
        .merge(with_rate_limit(api, limiters.get(PolicyName::Api)))
        .merge(with_rate_limit(public, limiters.get(PolicyName::Public)))
        .merge(with_rate_limit(upload, limiters.get(PolicyName::Upload)))
        .merge(with_rate_limit(
            assessment,
            limiters.get(PolicyName::Assessment),
        ))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn login() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid credentials" })))
}

async fn list_organizations() -> Json<Value> {
    Json(json!({ "items": [], "total": 0 }))
}

async fn list_memberships() -> Json<Value> {
    Json(json!({ "items": [], "total": 0 }))
}

async fn search_content() -> Json<Value> {
    Json(json!({ "results": [] }))
}

async fn create_upload() -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({ "status": "queued" })))
}

async fn submit_assessment(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::CREATED,
        Json(json!({ "assessmentId": id, "status": "submitted" })),
    )
}
