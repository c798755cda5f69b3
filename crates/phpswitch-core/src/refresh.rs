use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use phpswitch_model::Registry;
use tokio_util::sync::CancellationToken;

/// When the cached catalog is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub max_age: TimeDelta,
    /// Always refresh, regardless of age.
    pub force: bool,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_age: TimeDelta::days(7),
            force: false,
        }
    }
}

impl RefreshPolicy {
    #[must_use]
    pub fn with_max_age_days(days: u32) -> Self {
        Self {
            max_age: TimeDelta::days(i64::from(days)),
            force: false,
        }
    }

    #[must_use]
    pub fn needs_refresh(&self, registry: &Registry, now: DateTime<Utc>) -> bool {
        if self.force || registry.available_versions.is_empty() {
            return true;
        }
        match registry.last_updated {
            None => true,
            Some(last) => now - last >= self.max_age,
        }
    }
}

/// Single-flight guard and cancellation for the background catalog refresh.
#[derive(Debug, Default)]
pub struct BackgroundRefresh {
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Held for the lifetime of one refresh; releases the slot on drop.
#[derive(Debug)]
pub struct RefreshSlot {
    in_flight: Arc<AtomicBool>,
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

impl BackgroundRefresh {
    /// Claim the refresh slot, or `None` when a refresh is already running.
    #[must_use]
    pub fn try_begin(&self) -> Option<RefreshSlot> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(RefreshSlot {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
