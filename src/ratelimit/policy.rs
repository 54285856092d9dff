//! Named rate limit policies and rule overrides.
//!
//! The platform runs a handful of named limiters (auth, api, public, upload,
//! assessment) over one shared store. Each named policy namespaces its keys
//! with its own prefix so the counters never collide. Limits can be tuned
//! from a YAML rules file; policies it does not mention keep their defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::key::KeyStrategy;
use super::limiter::{LimitPolicy, RateLimiter};
use super::store::WindowStore;
use crate::error::{GatekeeperError, Result};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// The named policies used by the platform API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyName {
    /// Authentication endpoints
    Auth,
    /// General API endpoints
    Api,
    /// Public, unauthenticated endpoints
    Public,
    /// File uploads
    Upload,
    /// Assessment submissions
    Assessment,
}

impl PolicyName {
    pub const ALL: [PolicyName; 5] = [
        PolicyName::Auth,
        PolicyName::Api,
        PolicyName::Public,
        PolicyName::Upload,
        PolicyName::Assessment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::Auth => "auth",
            PolicyName::Api => "api",
            PolicyName::Public => "public",
            PolicyName::Upload => "upload",
            PolicyName::Assessment => "assessment",
        }
    }

    /// Key namespace for this policy's IP-based keys.
    pub fn key_prefix(&self) -> String {
        format!("{}_rate_limit:", self.as_str())
    }

    /// Built-in limit and window for this policy.
    pub fn default_limit(&self) -> (u64, Duration) {
        match self {
            PolicyName::Auth => (5, Duration::from_secs(15 * MINUTE)),
            PolicyName::Api => (100, Duration::from_secs(15 * MINUTE)),
            PolicyName::Public => (1000, Duration::from_secs(HOUR)),
            PolicyName::Upload => (10, Duration::from_secs(HOUR)),
            PolicyName::Assessment => (3, Duration::from_secs(HOUR)),
        }
    }

    /// The built-in policy.
    pub fn default_policy(&self) -> LimitPolicy {
        let (max_requests, window) = self.default_limit();
        LimitPolicy::builtin(max_requests, window, KeyStrategy::ip(self.key_prefix()))
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        PolicyName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| GatekeeperError::Config(format!("Unknown rate limit policy: {}", s)))
    }
}

/// Which request attribute a configured policy counts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    #[default]
    Ip,
    User,
    Organization,
}

/// Overrides for one named policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Partitioning attribute
    #[serde(default)]
    pub key: KeyKind,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl PolicyRule {
    /// Build the limiter policy for `name` from this rule.
    pub fn to_policy(&self, name: PolicyName) -> Result<LimitPolicy> {
        let key = match self.key {
            KeyKind::Ip => KeyStrategy::ip(name.key_prefix()),
            KeyKind::User => KeyStrategy::User,
            KeyKind::Organization => KeyStrategy::Organization,
        };

        let policy = LimitPolicy::new(self.max_requests, Duration::from_secs(self.window_secs))
            .map_err(|e| GatekeeperError::Config(format!("Policy '{}': {}", name, e)))?;

        Ok(policy
            .with_key(key)
            .skip_successful_requests(self.skip_successful_requests)
            .skip_failed_requests(self.skip_failed_requests))
    }
}

/// Rule overrides for the named policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRules {
    #[serde(default)]
    pub policies: HashMap<PolicyName, PolicyRule>,
}

impl PolicyRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// The effective policy for `name`: the override if present, else the default.
    pub fn policy(&self, name: PolicyName) -> Result<LimitPolicy> {
        match self.policies.get(&name) {
            Some(rule) => rule.to_policy(name),
            None => Ok(name.default_policy()),
        }
    }
}

/// One limiter per named policy, all counting into the same store.
pub struct RateLimiters {
    store: Arc<dyn WindowStore>,
    limiters: HashMap<PolicyName, Arc<RateLimiter>>,
}

impl RateLimiters {
    /// Build every named limiter with its default policy.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        let limiters = PolicyName::ALL
            .into_iter()
            .map(|name| {
                let limiter = RateLimiter::new(name.default_policy(), store.clone());
                (name, Arc::new(limiter))
            })
            .collect();

        Self { store, limiters }
    }

    /// Build every named limiter, applying the given overrides.
    pub fn with_rules(store: Arc<dyn WindowStore>, rules: &PolicyRules) -> Result<Self> {
        let mut limiters = HashMap::with_capacity(PolicyName::ALL.len());
        for name in PolicyName::ALL {
            let policy = rules.policy(name)?;
            info!(
                policy = %name,
                max_requests = policy.max_requests(),
                window_secs = policy.window().as_secs(),
                key = ?policy.key(),
                "Configured rate limit policy"
            );
            limiters.insert(name, Arc::new(RateLimiter::new(policy, store.clone())));
        }

        Ok(Self { store, limiters })
    }

    /// The limiter for a named policy.
    pub fn get(&self, name: PolicyName) -> Arc<RateLimiter> {
        // Every name is populated at construction.
        self.limiters[&name].clone()
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Tear down the shared store. Call once on graceful shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down rate limiters");
        self.store.destroy().await;
    }
}

/// A limiter that counts per authenticated user.
pub fn user_limiter(policy: LimitPolicy, store: Arc<dyn WindowStore>) -> RateLimiter {
    RateLimiter::new(policy.with_key(KeyStrategy::User), store)
}

/// A limiter that counts per organization.
pub fn organization_limiter(policy: LimitPolicy, store: Arc<dyn WindowStore>) -> RateLimiter {
    RateLimiter::new(policy.with_key(KeyStrategy::Organization), store)
}
