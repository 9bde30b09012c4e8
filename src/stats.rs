//! Hit/miss accounting

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    /// Shared-tier calls that failed or timed out
    pub l2_errors: u64,
    /// L1 entries after pending Moka writes are applied
    pub l1_entries: u64,
}

impl CacheStatistics {
    /// Percentage in `[0, 100]`; zero when there were no lookups.
    pub fn l1_hit_rate(&self) -> f64 {
        hit_rate(self.l1_hits, self.l1_misses)
    }

    pub fn l2_hit_rate(&self) -> f64 {
        hit_rate(self.l2_hits, self.l2_misses)
    }

    /// Share of all lookups served by either tier.
    pub fn overall_hit_rate(&self) -> f64 {
        // Every L2 lookup is preceded by an L1 miss.
        hit_rate(self.l1_hits + self.l2_hits, self.l2_misses)
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64 * 100.0
}

/// Monotonic counters shared by all callers of a cache.
#[derive(Debug, Default)]
pub struct StatisticsRecorder {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_error(&self) {
        self.l2_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, l1_entries: u64) -> CacheStatistics {
        CacheStatistics {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            l2_errors: self.l2_errors.load(Ordering::Relaxed),
            l1_entries,
        }
    }
}
