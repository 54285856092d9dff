//! Core rate limiter implementation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::key::{KeyStrategy, RequestMeta};
use super::store::WindowStore;
use super::window::RateWindow;
use crate::error::{GatekeeperError, Result};

/// Policy for a single limiter.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    /// Maximum requests allowed per key in one window
    max_requests: u64,
    /// Length of each fixed window
    window: Duration,
    /// How requests are partitioned into keys
    key: KeyStrategy,
    /// Refund the hit when the handled request succeeded
    skip_successful_requests: bool,
    /// Refund the hit when the handled request failed
    skip_failed_requests: bool,
}

impl LimitPolicy {
    /// Create a policy with the default IP-based key.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(GatekeeperError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatekeeperError::Config(
                "window must be greater than zero".to_string(),
            ));
        }
        let representable = ChronoDuration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .is_some();
        if !representable {
            return Err(GatekeeperError::Config(format!(
                "window of {}s is too large",
                window.as_secs()
            )));
        }

        Ok(Self::builtin(max_requests, window, KeyStrategy::default()))
    }

    /// Build one of the fixed built-in policies, whose values are known valid.
    pub(crate) fn builtin(max_requests: u64, window: Duration, key: KeyStrategy) -> Self {
        Self {
            max_requests,
            window,
            key,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn key(&self) -> &KeyStrategy {
        &self.key
    }

    pub fn skips_successful(&self) -> bool {
        self.skip_successful_requests
    }

    pub fn skips_failed(&self) -> bool {
        self.skip_failed_requests
    }

    pub fn with_key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Whether a request with the given outcome should not count.
    pub fn skips_outcome(&self, succeeded: bool) -> bool {
        if succeeded {
            self.skip_successful_requests
        } else {
            self.skip_failed_requests
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Key the request was counted under
    pub key: String,
    /// Whether the request is within quota
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u64,
    /// Requests left in the window, never negative
    pub remaining: u64,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
    /// Requests counted in the window so far
    pub total_hits: u64,
}

impl RateLimitDecision {
    fn from_window(key: String, limit: u64, window: &RateWindow) -> Self {
        Self {
            key,
            allowed: window.count <= limit,
            limit,
            remaining: limit.saturating_sub(window.count),
            reset_at: window.reset_at,
            total_hits: window.count,
        }
    }

    /// Whole seconds a rejected caller should wait, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// A fixed-window rate limiter over a shared window store.
///
/// Cheap to share behind an `Arc`; all mutable state lives in the store.
pub struct RateLimiter {
    policy: LimitPolicy,
    store: Arc<dyn WindowStore>,
}

impl RateLimiter {
    /// Create a limiter for `policy` counting into `store`.
    pub fn new(policy: LimitPolicy, store: Arc<dyn WindowStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    pub fn limit(&self) -> u64 {
        self.policy.max_requests
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Current time as seen by the backing store.
    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }

    /// Count a request and decide whether it is within quota.
    ///
    /// The request is counted even when it is rejected.
    pub async fn check(&self, request: &RequestMeta) -> Result<RateLimitDecision> {
        let key = self.policy.key.key_for(request);

        trace!(key = %key, limit = self.policy.max_requests, "Checking rate limit");

        let window = self
            .store
            .increment_or_create(&key, self.policy.window)
            .await?;
        let decision = RateLimitDecision::from_window(key, self.policy.max_requests, &window);

        if !decision.allowed {
            debug!(
                key = %decision.key,
                count = decision.total_hits,
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Look at the caller's current window without counting anything.
    ///
    /// Returns `None` when the caller has no live window.
    pub async fn peek(&self, request: &RequestMeta) -> Option<RateLimitDecision> {
        let key = self.policy.key.key_for(request);
        let window = self.store.peek(&key).await?;
        Some(RateLimitDecision::from_window(
            key,
            self.policy.max_requests,
            &window,
        ))
    }

    /// Whether the caller's next request would be rejected.
    pub async fn is_blocked(&self, request: &RequestMeta) -> bool {
        self.remaining(request).await == 0
    }

    /// Requests the caller may still make in the current window.
    pub async fn remaining(&self, request: &RequestMeta) -> u64 {
        self.peek(request)
            .await
            .map_or(self.policy.max_requests, |decision| decision.remaining)
    }

    /// When the caller's current window resets, if one is live.
    pub async fn reset_time(&self, request: &RequestMeta) -> Option<DateTime<Utc>> {
        self.peek(request).await.map(|decision| decision.reset_at)
    }

    /// Give back the hit counted by `decision`.
    ///
    /// Only the window the decision was counted in is touched; once that
    /// window has been replaced the refund is dropped.
    pub async fn refund(&self, decision: &RateLimitDecision) {
        trace!(key = %decision.key, "Refunding rate limit hit");
        self.store.decrement(&decision.key, decision.reset_at).await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{Clock, ManualClock};
    use crate::ratelimit::store::MemoryStore;

    fn limiter(max: u64, window_ms: u64) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::at_millis(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let policy = LimitPolicy::new(max, Duration::from_millis(window_ms)).unwrap();
        (clock, RateLimiter::new(policy, store))
    }

    fn caller(ip: &str) -> RequestMeta {
        RequestMeta {
            forwarded_for: Some(ip.to_string()),
            ..RequestMeta::default()
        }
    }

    #[test]
    fn test_policy_rejects_zero_values() {
        assert!(LimitPolicy::new(0, Duration::from_secs(1)).is_err());
        assert!(LimitPolicy::new(1, Duration::ZERO).is_err());
        assert!(LimitPolicy::new(1, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_policy_rejects_unrepresentable_window() {
        assert!(matches!(
            LimitPolicy::new(1, Duration::from_secs(u64::MAX)),
            Err(GatekeeperError::Config(_))
        ));
        assert!(matches!(
            LimitPolicy::new(1, Duration::from_secs(i64::MAX as u64 / 1000)),
            Err(GatekeeperError::Config(_))
        ));
        // A long but valid window is fine
        assert!(LimitPolicy::new(1, Duration::from_secs(100 * 365 * 86_400)).is_ok());
    }

    #[test]
    fn test_policy_skips_outcome() {
        let policy = LimitPolicy::new(1, Duration::from_secs(1))
            .unwrap()
            .skip_failed_requests(true);
        assert!(policy.skips_outcome(false));
        assert!(!policy.skips_outcome(true));
    }

    #[tokio::test]
    async fn test_first_request_allowed() {
        let (_clock, limiter) = limiter(10, 1000);

        let decision = limiter.check(&caller("1.1.1.1")).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.total_hits, 1);
        assert_eq!(decision.key, "rate_limit:1.1.1.1");
    }

    #[tokio::test]
    async fn test_over_limit_is_counted_and_floors_remaining() {
        let (_clock, limiter) = limiter(2, 1000);
        let request = caller("1.1.1.1");

        limiter.check(&request).await.unwrap();
        limiter.check(&request).await.unwrap();
        let third = limiter.check(&request).await.unwrap();
        let fourth = limiter.check(&request).await.unwrap();

        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(fourth.total_hits, 4);
        assert_eq!(fourth.remaining, 0);
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let (_clock, limiter) = limiter(3, 1000);
        let request = caller("1.1.1.1");

        assert!(limiter.peek(&request).await.is_none());
        assert_eq!(limiter.remaining(&request).await, 3);
        assert!(!limiter.is_blocked(&request).await);
        assert_eq!(limiter.reset_time(&request).await, None);

        limiter.check(&request).await.unwrap();
        for _ in 0..5 {
            assert_eq!(limiter.remaining(&request).await, 2);
        }
        assert_eq!(limiter.peek(&request).await.unwrap().total_hits, 1);
        assert_eq!(
            limiter.reset_time(&request).await.unwrap().timestamp_millis(),
            1000
        );
    }

    #[tokio::test]
    async fn test_is_blocked_once_quota_is_used() {
        let (_clock, limiter) = limiter(2, 1000);
        let request = caller("1.1.1.1");

        limiter.check(&request).await.unwrap();
        assert!(!limiter.is_blocked(&request).await);
        limiter.check(&request).await.unwrap();
        assert!(limiter.is_blocked(&request).await);
    }

    #[tokio::test]
    async fn test_peek_after_expiry() {
        let (clock, limiter) = limiter(1, 1000);
        let request = caller("1.1.1.1");

        limiter.check(&request).await.unwrap();
        clock.advance(Duration::from_millis(1001));

        assert!(limiter.peek(&request).await.is_none());
        assert!(!limiter.is_blocked(&request).await);
    }

    #[tokio::test]
    async fn test_refund_restores_quota() {
        let (_clock, limiter) = limiter(1, 1000);
        let request = caller("1.1.1.1");

        let decision = limiter.check(&request).await.unwrap();
        limiter.refund(&decision).await;

        assert!(limiter.check(&request).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_late_refund_does_not_touch_next_window() {
        let (clock, limiter) = limiter(1, 1000);
        let request = caller("1.1.1.1");

        let slow = limiter.check(&request).await.unwrap();
        clock.advance(Duration::from_millis(1001));
        let next = limiter.check(&request).await.unwrap();
        assert!(next.allowed);

        // The slow request finishes after its window was replaced
        limiter.refund(&slow).await;

        let over = limiter.check(&request).await.unwrap();
        assert!(!over.allowed);
        assert_eq!(over.total_hits, 2);
    }

    #[tokio::test]
    async fn test_retry_after_rounds_up() {
        let (clock, limiter) = limiter(1, 60_000);
        let decision = limiter.check(&caller("1.1.1.1")).await.unwrap();

        assert_eq!(decision.retry_after_secs(clock.now()), 60);
        clock.advance(Duration::from_millis(58_500));
        assert_eq!(decision.retry_after_secs(clock.now()), 2);
        clock.advance(Duration::from_millis(10_000));
        assert_eq!(decision.retry_after_secs(clock.now()), 0);
    }

    #[tokio::test]
    async fn test_destroyed_store_fails_check() {
        let (_clock, limiter) = limiter(1, 1000);
        limiter.store().destroy().await;

        assert!(matches!(
            limiter.check(&caller("1.1.1.1")).await,
            Err(GatekeeperError::StoreDestroyed)
        ));
    }
}
