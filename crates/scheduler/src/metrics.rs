use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam::utils::CachePadded;
use serde::Serialize;

/// Lock-free operation counters. Each counter sits on its own cache line so
/// hot paths on different threads do not contend.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    registered: CachePadded<AtomicU64>,
    overflowed: CachePadded<AtomicU64>,
    acquired: CachePadded<AtomicU64>,
    borrowed: CachePadded<AtomicU64>,
    exhausted: CachePadded<AtomicU64>,
    stale_bits: CachePadded<AtomicU64>,
    undersized: CachePadded<AtomicU64>,
    displaced: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`SchedulerMetrics`] for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Resources accepted by `register`.
    pub registered: u64,
    /// Registrations rejected by a full bounded queue.
    pub overflowed: u64,
    /// Resources handed out by `acquire`.
    pub acquired: u64,
    /// Acquisitions served from an energy level below the requested minimum.
    pub borrowed: u64,
    /// Acquisitions that found nothing.
    pub exhausted: u64,
    /// Bits found set in front of an empty queue and cleared.
    pub stale_bits: u64,
    /// Clamped resources inspected and set aside as too small.
    pub undersized: u64,
    /// Set-aside resources that could not be re-enqueued.
    pub displaced: u64,
    pub taken_at: DateTime<Utc>,
}

impl SchedulerMetrics {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn record_registered(&self) {
        Self::bump(&self.registered, 1);
    }

    pub fn record_overflow(&self) {
        Self::bump(&self.overflowed, 1);
    }

    /// Record a successful acquisition; `borrowed` when served below the requested energy.
    pub fn record_acquired(&self, borrowed: bool) {
        Self::bump(&self.acquired, 1);
        if borrowed {
            Self::bump(&self.borrowed, 1);
        }
    }

    pub fn record_exhausted(&self) {
        Self::bump(&self.exhausted, 1);
    }

    pub fn record_stale_bit(&self) {
        Self::bump(&self.stale_bits, 1);
    }

    pub fn record_undersized(&self, count: u64) {
        Self::bump(&self.undersized, count);
    }

    pub fn record_displaced(&self, count: u64) {
        Self::bump(&self.displaced, count);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            registered: read(&self.registered),
            overflowed: read(&self.overflowed),
            acquired: read(&self.acquired),
            borrowed: read(&self.borrowed),
            exhausted: read(&self.exhausted),
            stale_bits: read(&self.stale_bits),
            undersized: read(&self.undersized),
            displaced: read(&self.displaced),
            taken_at: Utc::now(),
        }
    }
}
