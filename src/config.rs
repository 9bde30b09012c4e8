//! Cache configuration

use std::time::Duration;

/// Configuration for the layered cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the L1 cache
    pub l1_max_capacity: u64,
    /// TTL applied when a caller or descriptor does not supply one
    pub default_ttl: Duration,
    /// L1 TTL after an L2 hit whose remaining TTL is unknown
    pub l1_backfill_ttl: Duration,
    /// Upper bound for every L2 call
    pub l2_timeout: Duration,
    /// Share one factory run between concurrent `get_or_compute` misses on a key
    pub coalesce_misses: bool,
    /// Number of warm-up factories run concurrently
    pub warm_up_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_capacity: 10_000,
            default_ttl: Duration::from_secs(900),     // 15 minutes
            l1_backfill_ttl: Duration::from_secs(300), // 5 minutes
            l2_timeout: Duration::from_millis(250),
            coalesce_misses: false,
            warm_up_concurrency: 4,
        }
    }
}

impl CacheConfig {
    pub fn with_l1_max_capacity(mut self, capacity: u64) -> Self {
        self.l1_max_capacity = capacity;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_l1_backfill_ttl(mut self, ttl: Duration) -> Self {
        self.l1_backfill_ttl = ttl;
        self
    }

    pub fn with_l2_timeout(mut self, timeout: Duration) -> Self {
        self.l2_timeout = timeout;
        self
    }

    pub fn with_coalesce_misses(mut self, enabled: bool) -> Self {
        self.coalesce_misses = enabled;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_warm_up_concurrency(mut self, concurrency: usize) -> Self {
        self.warm_up_concurrency = concurrency.max(1);
        self
    }
}
