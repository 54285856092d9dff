//! Counting window for a single rate limit key.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// One caller's current fixed counting window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    /// Requests observed in this window
    pub count: u64,
    /// When this window expires
    pub reset_at: DateTime<Utc>,
    /// Reserved; never consulted by the counting logic
    pub blocked: bool,
}

impl RateWindow {
    /// Open a new window at `now` that has already counted one request.
    ///
    /// A window reaching past the representable range ends at
    /// `DateTime::<Utc>::MAX_UTC`.
    pub fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: now
                .checked_add_signed(to_chrono(window))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            blocked: false,
        }
    }

    /// A window is expired strictly after its reset time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_at
    }

    /// Time left until the window resets, zero once it has passed.
    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Convert a std duration to a chrono one, saturating at chrono's maximum.
pub(crate) fn to_chrono(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX)
}
