//! Stack-level hit statistics.
//!
//! Purely observational; the read path never consults these counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters maintained by the stack.
#[derive(Debug, Default)]
pub struct StackStats {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    back_populations: AtomicU64,
}

impl StackStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_back_population(&self) {
        self.back_populations.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            back_populations: self.back_populations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StackStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Fresh top-of-probe hits (including lower-layer hits).
    pub hits: u64,
    /// Stale hits served while a background refresh ran.
    pub stale_hits: u64,
    /// True misses (no entry in any layer).
    pub misses: u64,
    /// Entries found but already expired.
    pub expirations: u64,
    /// Successful refreshes (blocking and background).
    pub refreshes: u64,
    /// Refreshes that ended in an error.
    pub refresh_failures: u64,
    /// Completed back-population passes.
    pub back_populations: u64,
}

impl StatsSnapshot {
    /// Fraction of reads answered without a blocking refresh (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses + self.expirations;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
