//! tiercache - Two-tier caching library
//!
//! This library provides a layered cache-aside engine:
//! - L1: In-memory Moka cache (fastest, per process)
//! - L2: Shared tier, Redis in production (shared across instances)
//!
//! The cache supports:
//! - Read-through with automatic L1 backfill after an L2 hit
//! - Write-through that survives an unreachable L2
//! - Get-or-compute, warm-up, hit/miss statistics
//! - Transparent request caching as a pipeline stage, keyed by a SHA-256
//!   digest of the request
//!
//! Build one [`LayeredCache`] at startup and hand clones of it to whatever
//! needs it; clones share the same tiers and counters.

mod codec;
mod config;
mod error;
pub mod interceptor;
mod key;
mod layered_cache;
mod local_tier;
pub mod pipeline;
mod redis_tier;
mod shared_tier;
mod stats;

pub use codec::{JsonCodec, PayloadCodec};
pub use config::CacheConfig;
pub use error::{CacheError, TierOutcome};
pub use interceptor::{CacheableDescriptor, CacheableRequest, CacheableResponse, CachingBehavior};
pub use key::{CacheKey, KeyDeriver};
pub use layered_cache::{LayeredCache, WarmUpEntry, WarmUpReport};
pub use local_tier::{CacheEntry, LocalTier};
pub use pipeline::{LoggingBehavior, Pipeline, PipelineBehavior, RequestHandler};
pub use redis_tier::RedisTier;
pub use shared_tier::{MemorySharedTier, SharedTier, StoredValue};
pub use stats::{CacheStatistics, StatisticsRecorder};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
