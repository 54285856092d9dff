//! Router-level tests for the rate limited API.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use gatekeeper::http::router;
use gatekeeper::ratelimit::{MemoryStore, PolicyRules, RateLimiters};

fn get_from(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_rejection_body_and_headers() {
    let rules = PolicyRules::from_yaml(
        r#"
policies:
  public:
    max_requests: 2
    window_secs: 60
"#,
    )
    .unwrap();
    let limiters = RateLimiters::with_rules(Arc::new(MemoryStore::new()), &rules).unwrap();
    let app = router(&limiters);
    let from = [("x-forwarded-for", "203.0.113.1")];

    for expected_remaining in ["1", "0"] {
        let response = app
            .clone()
            .oneshot(get_from("/api/content/search", &from))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected_remaining);
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    let response = app
        .oneshot(get_from("/api/content/search", &from))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["message"], "Rate limit exceeded");
    assert_eq!(body["details"]["limit"], 2);
    assert_eq!(body["details"]["remaining"], 0);
    assert!(body["details"]["resetTime"].as_str().unwrap().ends_with('Z'));
    let retry_after = body["details"]["retryAfter"].as_u64().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
}

#[tokio::test]
async fn test_user_keyed_policy_from_rules() {
    let rules = PolicyRules::from_yaml(
        r#"
policies:
  api:
    max_requests: 1
    window_secs: 60
    key: user
"#,
    )
    .unwrap();
    let limiters = RateLimiters::with_rules(Arc::new(MemoryStore::new()), &rules).unwrap();
    let app = router(&limiters);
    let shared_ip = ("x-forwarded-for", "198.51.100.4");

    let alice = app
        .clone()
        .oneshot(get_from("/api/organizations", &[shared_ip, ("x-user-id", "alice")]))
        .await
        .unwrap();
    let bob = app
        .clone()
        .oneshot(get_from("/api/organizations", &[shared_ip, ("x-user-id", "bob")]))
        .await
        .unwrap();
    let alice_again = app
        .oneshot(get_from("/api/memberships", &[shared_ip, ("x-user-id", "alice")]))
        .await
        .unwrap();

    assert_eq!(alice.status(), StatusCode::OK);
    assert_eq!(bob.status(), StatusCode::OK);
    assert_eq!(alice_again.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_shutdown_turns_checks_into_internal_errors() {
    let limiters = RateLimiters::new(Arc::new(MemoryStore::new()));
    let app = router(&limiters);
    limiters.shutdown().await;

    let response = app
        .oneshot(get_from("/api/organizations", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
