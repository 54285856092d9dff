//! Gatekeeper - fixed-window rate limiting for the platform API
//!
//! This crate implements per-caller fixed-window rate limiting for the
//! ministry platform's HTTP API. Named policies (auth, api, public, upload,
//! assessment) share one in-process window store, and an axum middleware
//! turns limiter decisions into quota headers or 429 responses.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
