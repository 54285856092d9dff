//! HTTP adapter: axum middleware, error responses and the API server.

mod middleware;
mod response;
mod server;

pub use middleware::{rate_limit, with_rate_limit};
pub use response::{
    apply_rate_limit_headers, iso_timestamp, ApiError, ErrorBody, ErrorCode, RateLimitDetails,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{router, HttpServer};
