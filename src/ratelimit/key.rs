//! Partition key derivation for inbound requests.

use axum::http::HeaderMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Header carrying the client address chain set by proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the tenant organization id.
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";

/// Prefix used by the default IP-based key.
pub const DEFAULT_PREFIX: &str = "rate_limit:";
/// Prefix for per-user keys.
pub const USER_PREFIX: &str = "user_rate_limit:";
/// Prefix for per-organization keys.
pub const ORGANIZATION_PREFIX: &str = "org_rate_limit:";

/// Sentinel used when no client address can be determined.
const UNKNOWN_CLIENT: &str = "unknown";

/// The parts of an inbound request that key derivation looks at.
///
/// Kept independent of any particular transport so limiters can be used
/// outside of HTTP handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Raw `x-forwarded-for` value
    pub forwarded_for: Option<String>,
    /// Address of the connected peer
    pub remote_addr: Option<SocketAddr>,
    /// Authenticated user id
    pub user_id: Option<String>,
    /// Tenant organization id
    pub organization_id: Option<String>,
}

impl RequestMeta {
    /// Collect request metadata from HTTP headers and the peer address.
    pub fn from_headers(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            forwarded_for: header_value(headers, FORWARDED_FOR_HEADER),
            remote_addr,
            user_id: header_value(headers, USER_ID_HEADER),
            organization_id: header_value(headers, ORGANIZATION_ID_HEADER),
        }
    }

    /// The best guess at the client address.
    ///
    /// Takes the first entry of the forwarded-for chain, then the peer
    /// address, then the `unknown` sentinel.
    pub fn client_ip(&self) -> String {
        self.forwarded_for
            .as_deref()
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_owned)
            .or_else(|| self.remote_addr.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Custom key derivation function.
pub type KeyFn = Arc<dyn Fn(&RequestMeta) -> String + Send + Sync>;

/// Strategy for mapping a request to the key it is counted under.
#[derive(Clone)]
pub enum KeyStrategy {
    /// Count per client address, namespaced by `prefix`
    Ip { prefix: String },
    /// Count per authenticated user, falling back to the default IP key
    User,
    /// Count per organization, falling back to the default IP key
    Organization,
    /// Arbitrary derivation
    Custom(KeyFn),
}

impl KeyStrategy {
    /// IP-based keys under the given namespace.
    pub fn ip(prefix: impl Into<String>) -> Self {
        KeyStrategy::Ip {
            prefix: prefix.into(),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestMeta) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(f))
    }

    /// Derive the partition key for a request.
    pub fn key_for(&self, request: &RequestMeta) -> String {
        match self {
            KeyStrategy::Ip { prefix } => format!("{}{}", prefix, request.client_ip()),
            KeyStrategy::User => match &request.user_id {
                Some(user_id) => format!("{}{}", USER_PREFIX, user_id),
                None => default_key(request),
            },
            KeyStrategy::Organization => match &request.organization_id {
                Some(org_id) => format!("{}{}", ORGANIZATION_PREFIX, org_id),
                None => default_key(request),
            },
            KeyStrategy::Custom(f) => f(request),
        }
    }
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::ip(DEFAULT_PREFIX)
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip { prefix } => f.debug_struct("Ip").field("prefix", prefix).finish(),
            KeyStrategy::User => write!(f, "User"),
            KeyStrategy::Organization => write!(f, "Organization"),
            KeyStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

fn default_key(request: &RequestMeta) -> String {
    format!("{}{}", DEFAULT_PREFIX, request.client_ip())
}
