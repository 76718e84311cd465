//! Supervisor counters
//!
//! Counters only, monotonic, relaxed atomics. Read through `snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters of one supervisor and its bus
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    feeds_opened: AtomicU64,
    feeds_released: AtomicU64,
    open_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    reconnect_cycles: AtomicU64,
    reconnects_skipped: AtomicU64,
    keepalive_failures: AtomicU64,
    events_published: AtomicU64,
    listener_faults: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub feeds_opened: u64,
    pub feeds_released: u64,
    pub open_failures: u64,
    pub reconnects_scheduled: u64,
    pub reconnect_cycles: u64,
    pub reconnects_skipped: u64,
    pub keepalive_failures: u64,
    pub events_published: u64,
    pub listener_faults: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_feeds_opened(&self) {
        self.feeds_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feeds_released(&self) {
        self.feeds_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_open_failures(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnect_cycles(&self) {
        self.reconnect_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects_skipped(&self) {
        self.reconnects_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_keepalive_failures(&self) {
        self.keepalive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_listener_faults(&self, faults: u64) {
        self.listener_faults.fetch_add(faults, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            feeds_opened: self.feeds_opened.load(Ordering::Relaxed),
            feeds_released: self.feeds_released.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            reconnect_cycles: self.reconnect_cycles.load(Ordering::Relaxed),
            reconnects_skipped: self.reconnects_skipped.load(Ordering::Relaxed),
            keepalive_failures: self.keepalive_failures.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            listener_faults: self.listener_faults.load(Ordering::Relaxed),
        }
    }
}
