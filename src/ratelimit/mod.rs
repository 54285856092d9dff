//! Rate limiting logic and state management.

mod clock;
mod key;
mod limiter;
mod policy;
mod store;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{
    KeyFn, KeyStrategy, RequestMeta, DEFAULT_PREFIX, FORWARDED_FOR_HEADER,
    ORGANIZATION_ID_HEADER, ORGANIZATION_PREFIX, USER_ID_HEADER, USER_PREFIX,
};
pub use limiter::{LimitPolicy, RateLimitDecision, RateLimiter};
pub use policy::{
    organization_limiter, user_limiter, KeyKind, PolicyName, PolicyRule, PolicyRules,
    RateLimiters,
};
pub use store::{MemoryStore, WindowStore, DEFAULT_SWEEP_INTERVAL};
pub use window::RateWindow;
