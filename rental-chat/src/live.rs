//! Plumbing shared by every live view: retry backoff, connectivity health
//! and the subscription epoch used to discard results that arrive after
//! cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Exponential backoff for re-establishing store subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before retry number `attempt` (0-based): initial * 2^attempt,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30))
    }
}

/// Cancellation token for one live view.
///
/// Workers capture an [`EpochTicket`] when they start; once the owner calls
/// [`cancel`](Self::cancel) every outstanding ticket goes stale and its
/// results must be dropped.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionEpoch {
    current: Arc<AtomicU64>,
}

impl SubscriptionEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> EpochTicket {
        EpochTicket {
            current: self.current.clone(),
            issued: self.current.load(Ordering::SeqCst),
        }
    }

    pub fn cancel(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct EpochTicket {
    current: Arc<AtomicU64>,
    issued: u64,
}

impl EpochTicket {
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.issued
    }
}

/// Connectivity as seen by the live views that are currently retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub degraded_views: usize,
    pub max_consecutive_failures: u32,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.degraded_views == 0
    }
}

/// Tracks consecutive store failures per live view.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    degraded: DashMap<u64, u32>,
    next_view: AtomicU64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new live view.
    pub fn register(&self) -> u64 {
        self.next_view.fetch_add(1, Ordering::Relaxed)
    }

    pub fn record_failure(&self, view: u64, consecutive: u32) {
        self.degraded.insert(view, consecutive);
    }

    /// The view is live again, or it went away.
    pub fn clear(&self, view: u64) {
        self.degraded.remove(&view);
    }

    pub fn snapshot(&self) -> Health {
        Health {
            degraded_views: self.degraded.len(),
            max_consecutive_failures: self
                .degraded
                .iter()
                .map(|entry| *entry.value())
                .max()
                .unwrap_or(0),
        }
    }
}
