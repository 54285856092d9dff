//! Window storage for rate limit counters.
//!
//! The store is the only owner of counting windows. Limiters go through
//! [`WindowStore::increment_or_create`] and never touch counts directly, so
//! several named limiters can share one store as long as their keys are
//! prefixed apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::window::RateWindow;
use crate::error::{GatekeeperError, Result};

/// Default interval between background sweeps of expired windows.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Trait for window stores.
///
/// Abstracts over where windows live so the limiter and middleware do not
/// care whether counters are in process memory or somewhere shared.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// The store's notion of the current time, used for expiry.
    fn now(&self) -> DateTime<Utc>;

    /// Get the stored window for a key, expired or not.
    async fn get(&self, key: &str) -> Option<RateWindow>;

    /// Get the window for a key only if it is still live.
    async fn peek(&self, key: &str) -> Option<RateWindow>;

    /// Replace the stored window for a key.
    async fn set(&self, key: &str, window: RateWindow);

    /// Count one request against `key`, opening a fresh window of length
    /// `window` when none exists or the existing one has expired.
    async fn increment_or_create(&self, key: &str, window: Duration) -> Result<RateWindow>;

    /// Give back one request counted in the live window ending at `reset_at`.
    ///
    /// Does nothing once that window has expired or been replaced.
    async fn decrement(&self, key: &str, reset_at: DateTime<Utc>);

    /// Stop background work and drop every window.
    async fn destroy(&self);
}

/// In-process window store.
///
/// Each key's check-then-act runs under the shard lock of the underlying
/// map, so concurrent requests for the same key never lose increments.
/// Increments hold the `destroyed` lock for reading and `destroy` takes it
/// for writing, so no window is written after the store is cleared.
pub struct MemoryStore {
    windows: DashMap<String, RateWindow>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    destroyed: RwLock<bool>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
            destroyed: RwLock::new(false),
        }
    }

    /// Spawn the periodic sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference, so it ends on its own once the
    /// last strong handle to the store is gone. Restarting replaces any
    /// sweeper already running.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        if self.is_destroyed() {
            warn!("Ignoring sweeper start on a destroyed store");
            return;
        }
        if interval.is_zero() {
            warn!("Sweep interval is zero, background sweep disabled");
            return;
        }

        let store = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.sweep();
                debug!(
                    evicted = evicted,
                    remaining = store.len(),
                    "Swept expired rate limit windows"
                );
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Rate limit sweeper started");
    }

    /// Whether a background sweeper is currently attached.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Remove every expired window and return how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;
        self.windows.retain(|_, window| {
            let keep = !window.is_expired(now);
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Number of tracked keys, live or awaiting sweep.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.read()
    }

    fn count_hit(&self, key: &str, window: Duration) -> Result<RateWindow> {
        let destroyed = self.destroyed.read();
        if *destroyed {
            return Err(GatekeeperError::StoreDestroyed);
        }

        let now = self.clock.now();
        let updated = match self.windows.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_expired(now) {
                    trace!(key = %key, previous_count = current.count, "Window expired, resetting");
                    *current = RateWindow::open(now, window);
                } else {
                    current.count = current.count.saturating_add(1);
                }
                current.clone()
            }
            Entry::Vacant(vacant) => {
                let fresh = RateWindow::open(now, window);
                debug!(key = %key, reset_at = %fresh.reset_at, "Opening rate limit window");
                vacant.insert(fresh.clone());
                fresh
            }
        };

        Ok(updated)
    }

    fn clear(&self) -> Option<usize> {
        let mut destroyed = self.destroyed.write();
        if *destroyed {
            return None;
        }
        *destroyed = true;

        let dropped = self.windows.len();
        self.windows.clear();
        Some(dropped)
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn get(&self, key: &str) -> Option<RateWindow> {
        self.windows.get(key).map(|window| window.value().clone())
    }

    async fn peek(&self, key: &str) -> Option<RateWindow> {
        let now = self.clock.now();
        self.windows
            .get(key)
            .filter(|window| !window.is_expired(now))
            .map(|window| window.value().clone())
    }

    async fn set(&self, key: &str, window: RateWindow) {
        self.windows.insert(key.to_owned(), window);
    }

    async fn increment_or_create(&self, key: &str, window: Duration) -> Result<RateWindow> {
        self.count_hit(key, window)
    }

    async fn decrement(&self, key: &str, reset_at: DateTime<Utc>) {
        let now = self.clock.now();
        if let Some(mut window) = self.windows.get_mut(key) {
            if window.reset_at == reset_at && !window.is_expired(now) {
                window.count = window.count.saturating_sub(1);
            } else {
                trace!(key = %key, "Counted window is gone, dropping refund");
            }
        }
    }

    async fn destroy(&self) {
        let Some(dropped) = self.clear() else {
            return;
        };
        self.stop_sweeper();
        info!(dropped = dropped, "Rate limit store destroyed");
    }
}
