//! Error bodies and quota headers for rate limited responses.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::warn;

use crate::ratelimit::RateLimitDecision;

/// Maximum requests allowed in the window.
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests remaining in the current window.
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// ISO-8601 time at which the window resets.
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimitExceeded,
    InternalServerError,
}

/// Quota details attached to a rate limit rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDetails {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: String,
    pub retry_after: u64,
}

/// JSON error body returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<RateLimitDetails>,
}

/// Errors the middleware turns into responses.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// The caller is over quota
    RateLimited(RateLimitDetails),
    /// The limiter itself failed
    Internal(String),
}

impl ApiError {
    /// Build a rejection for `decision` as of `now`.
    pub fn rate_limited(decision: &RateLimitDecision, now: DateTime<Utc>) -> Self {
        ApiError::RateLimited(RateLimitDetails {
            limit: decision.limit,
            remaining: 0,
            reset_time: iso_timestamp(decision.reset_at),
            retry_after: decision.retry_after_secs(now),
        })
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::RateLimited(details) => ErrorBody {
                code: ErrorCode::RateLimitExceeded,
                message: "Rate limit exceeded".to_string(),
                details: Some(details.clone()),
            },
            ApiError::Internal(message) => ErrorBody {
                code: ErrorCode::InternalServerError,
                message: message.clone(),
                details: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();

        if let ApiError::RateLimited(details) = &self {
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(details.limit));
            headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(0u64));
            insert_str(headers, &X_RATELIMIT_RESET, &details.reset_time);
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(details.retry_after),
            );
        }

        response
    }
}

/// Decorate a handled response with the caller's quota.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    insert_str(headers, &X_RATELIMIT_RESET, &iso_timestamp(decision.reset_at));
}

/// Format a timestamp like `2024-05-01T12:00:00.000Z`.
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn insert_str(headers: &mut HeaderMap, name: &HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name.clone(), value);
        }
        Err(e) => warn!(header = %name, error = %e, "Dropping invalid header value"),
    }
}
