//! Rate limiting middleware for axum.
//!
//! Wraps handlers with a [`RateLimiter`]: over-quota callers get a 429 with
//! retry guidance, everyone else gets the handler's response decorated with
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
//!
//! ```ignore
//! use axum::{middleware, routing::post, Router};
//!
//! let app = Router::new()
//!     .route("/api/auth/login", post(login))
//!     .route_layer(middleware::from_fn_with_state(limiter, rate_limit));
//! ```

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, instrument};

use super::response::{apply_rate_limit_headers, ApiError};
use crate::ratelimit::{RateLimiter, RequestMeta};

/// Enforce `limiter` in front of the next handler.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let meta = RequestMeta::from_headers(request.headers(), remote_addr);

    let decision = match limiter.check(&meta).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, "Rate limit check failed");
            return ApiError::Internal("Rate limit check failed".to_string()).into_response();
        }
    };

    if !decision.allowed {
        return ApiError::rate_limited(&decision, limiter.now()).into_response();
    }

    let mut response = next.run(request).await;

    let succeeded = !(response.status().is_client_error() || response.status().is_server_error());
    if limiter.policy().skips_outcome(succeeded) {
        limiter.refund(&decision).await;
    }

    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

/// Put every route of `router` behind `limiter`.
///
/// Applied as a route layer, so unmatched paths are not counted.
pub fn with_rate_limit<S>(router: Router<S>, limiter: Arc<RateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(limiter, rate_limit))
}
