//! Two-tier cache-aside coordinator
//!
//! - L1: process-local Moka tier (fastest, never fails)
//! - L2: pluggable shared tier (Redis in production, may be unreachable)
//!
//! Reads go L1 then L2, backfilling L1 on an L2 hit. Writes go to both tiers;
//! an L2 failure is logged and the write still counts as done because L1 holds
//! the value. Every L2 call is bounded by `CacheConfig::l2_timeout`.
//!
//! There is no cross-tier transaction: the tiers may disagree for as long as
//! the shorter of TTL granularity and the latency of the last write.
//!
//! `get_or_compute` does not serialize concurrent misses unless
//! `CacheConfig::coalesce_misses` is set, in which case one caller runs the
//! factory and the others wait for its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::key::validate_key;
use crate::{
    CacheConfig, CacheError, CacheStatistics, JsonCodec, LocalTier, PayloadCodec, SharedTier,
    StatisticsRecorder, TierOutcome,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Progress of an in-flight computation as seen by waiters
#[derive(Clone)]
enum InFlightState {
    Pending,
    Ready(Arc<[u8]>),
    /// The factory itself failed
    Failed(String),
    /// The leader went away or could not publish a payload; waiters compute
    Abandoned,
}

type InFlightFetch = watch::Receiver<InFlightState>;
type InFlightSender = watch::Sender<InFlightState>;
type InFlightMap = Arc<Mutex<HashMap<String, InFlightFetch>>>;

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<String, InFlightFetch>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes the key from the in-flight map and then publishes
/// the outcome, `Abandoned` if none was recorded.
struct InFlightGuard {
    key: String,
    in_flight: InFlightMap,
    tx: InFlightSender,
    outcome: Option<InFlightState>,
}

impl InFlightGuard {
    fn new(key: String, in_flight: InFlightMap, tx: InFlightSender) -> Self {
        Self {
            key,
            in_flight,
            tx,
            outcome: None,
        }
    }

    /// Complete the computation with an outcome, consuming the guard.
    fn complete(mut self, outcome: InFlightState) {
        self.outcome = Some(outcome);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // Unregister first so a waiter that retries can take over as leader
        lock(&self.in_flight).remove(&self.key);
        let outcome = self.outcome.take().unwrap_or(InFlightState::Abandoned);
        let _ = self.tx.send(outcome);
    }
}

enum Role {
    Leader(InFlightGuard),
    Waiter(InFlightFetch),
}

/// Wait until the leader publishes something other than `Pending`.
async fn wait_for_leader(mut rx: InFlightFetch) -> InFlightState {
    loop {
        let state = rx.borrow_and_update().clone();
        if !matches!(state, InFlightState::Pending) {
            return state;
        }
        if rx.changed().await.is_err() {
            return match rx.borrow().clone() {
                InFlightState::Pending => InFlightState::Abandoned,
                state => state,
            };
        }
    }
}

/// One warm-up item: a key, its TTL, and the future producing its value.
pub struct WarmUpEntry<T> {
    key: String,
    ttl: Duration,
    factory: BoxFuture<'static, Result<T, BoxError>>,
}

impl<T> WarmUpEntry<T> {
    pub fn new<F, E>(key: impl Into<String>, ttl: Duration, factory: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            key: key.into(),
            ttl,
            factory: Box::pin(async move { factory.await.map_err(Into::into) }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Outcome of a warm-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    pub warmed: usize,
    /// Keys whose factory or write failed
    pub failed: Vec<String>,
}

/// Two-tier cache. Cloning yields another handle to the same cache.
pub struct LayeredCache<C: PayloadCodec = JsonCodec> {
    inner: Arc<LayeredCacheInner<C>>,
}

struct LayeredCacheInner<C: PayloadCodec> {
    local: LocalTier,
    shared: Option<Arc<dyn SharedTier>>,
    codec: C,
    config: CacheConfig,
    stats: StatisticsRecorder,
    /// Track in-flight computations for miss coalescing
    in_flight: InFlightMap,
}

impl<C: PayloadCodec> Clone for LayeredCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LayeredCache<JsonCodec> {
    /// Create a cache over the given shared tier with JSON payloads.
    pub fn new(shared: impl SharedTier, config: CacheConfig) -> Self {
        let shared: Arc<dyn SharedTier> = Arc::new(shared);
        Self::with_codec(Some(shared), JsonCodec, config)
    }

    /// Create a cache with no shared tier; fall-through lookups count as L2 misses.
    pub fn local_only(config: CacheConfig) -> Self {
        Self::with_codec(None, JsonCodec, config)
    }
}

impl<C: PayloadCodec> LayeredCache<C> {
    pub fn with_codec(shared: Option<Arc<dyn SharedTier>>, codec: C, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(LayeredCacheInner {
                local: LocalTier::new(config.l1_max_capacity),
                shared,
                codec,
                config,
                stats: StatisticsRecorder::new(),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Direct access to L1, e.g. to evict a single local copy.
    pub fn tier_one(&self) -> &LocalTier {
        &self.inner.local
    }

    /// Counter snapshot plus the current L1 entry count.
    ///
    /// Applies Moka's pending writes first so recent inserts are counted.
    pub async fn statistics(&self) -> CacheStatistics {
        self.inner.local.run_pending_tasks().await;
        self.inner.stats.snapshot(self.inner.local.entry_count())
    }

    /// Get a value, L1 first then L2.
    ///
    /// A missing key is `Ok(None)`; an L2 outage also reads as a miss. A stored
    /// payload that does not decode as `T` is evicted from both tiers and
    /// reported as `CacheError::Serialization`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        validate_key(key)?;

        let Some(payload) = self.lookup(key).await else {
            return Ok(None);
        };

        match self.inner.codec.decode(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                self.evict(key).await;
                Err(e)
            }
        }
    }

    /// Write a value to both tiers.
    ///
    /// Succeeds once L1 holds the value; an L2 failure is only logged. A zero
    /// TTL stores nothing and evicts any previous value.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        validate_key(key)?;

        if ttl.is_zero() {
            debug!("Zero TTL for key {}; evicting instead of storing", key);
            self.evict(key).await;
            return Ok(());
        }

        let payload: Arc<[u8]> = self.inner.codec.encode(value)?.into();
        self.store(key, payload, ttl).await;
        Ok(())
    }

    /// Remove a key from both tiers independently.
    ///
    /// Returns `Degraded` when L1 was cleared but L2 could not be reached.
    /// Nothing is retried.
    pub async fn remove(&self, key: &str) -> Result<TierOutcome, CacheError> {
        validate_key(key)?;
        Ok(self.evict(key).await)
    }

    /// Whether an unexpired value exists in either tier.
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;

        if self.inner.local.contains(key).await {
            return Ok(true);
        }

        let Some(shared) = &self.inner.shared else {
            return Ok(false);
        };

        match self.bounded(shared.exists(key)).await {
            Ok(found) => Ok(found),
            Err(e) => {
                warn!("L2 EXISTS error for key {} ({}). Treating as absent.", key, e);
                Ok(false)
            }
        }
    }

    /// Cache-aside: return the cached value or compute, store and return it.
    ///
    /// Concurrent misses on the same key each run `factory` (the last write
    /// wins) unless miss coalescing is enabled. Only a factory failure or an
    /// invalid key is returned as an error; cache-side failures are logged.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match self.get::<T>(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e @ CacheError::InvalidKey(_)) => return Err(e),
            Err(e) => warn!("Cache read failed for key {} ({}). Recomputing.", key, e),
        }

        if self.inner.config.coalesce_misses {
            return self.compute_coalesced(key, ttl, factory).await;
        }

        let value = factory().await.map_err(|e| CacheError::Compute(e.into()))?;
        if let Err(e) = self.set(key, &value, ttl).await {
            warn!("Failed to cache computed value for key {}: {}", key, e);
        }
        Ok(value)
    }

    /// Flush both tiers.
    ///
    /// Best effort and not atomic: operations in flight while this runs may
    /// repopulate either tier.
    pub async fn clear(&self) -> TierOutcome {
        warn!("Clearing all cache tiers");
        self.inner.local.clear();

        let Some(shared) = &self.inner.shared else {
            return TierOutcome::Complete;
        };

        match self.bounded(shared.clear()).await {
            Ok(()) => TierOutcome::Complete,
            Err(e) => {
                warn!("L2 CLEAR error ({}). L1 cleared only.", e);
                TierOutcome::Degraded
            }
        }
    }

    /// Compute and store each entry, typically once before serving traffic.
    ///
    /// Failing entries are logged and skipped.
    pub async fn warm_up<T>(&self, entries: Vec<WarmUpEntry<T>>) -> WarmUpReport
    where
        T: Serialize + Send + 'static,
    {
        let total = entries.len();
        let concurrency = self.inner.config.warm_up_concurrency.max(1);

        let results: Vec<(String, Result<(), CacheError>)> = futures::stream::iter(entries)
            .map(|entry| async move {
                let WarmUpEntry { key, ttl, factory } = entry;
                let result = match factory.await {
                    Ok(value) => self.set(&key, &value, ttl).await,
                    Err(e) => Err(CacheError::Compute(e)),
                };
                (key, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = WarmUpReport::default();
        for (key, result) in results {
            match result {
                Ok(()) => report.warmed += 1,
                Err(e) => {
                    error!("Cache warm-up failed for key {}: {}", key, e);
                    report.failed.push(key);
                }
            }
        }

        info!(
            "Cache warm-up finished: {}/{} entries stored",
            report.warmed, total
        );
        report
    }

    /// Raw lookup with statistics and L1 backfill.
    async fn lookup(&self, key: &str) -> Option<Arc<[u8]>> {
        if let Some(entry) = self.inner.local.get(key).await {
            self.inner.stats.record_l1_hit();
            debug!("Cache hit L1 for key: {}", key);
            return Some(Arc::clone(entry.payload()));
        }

        self.inner.stats.record_l1_miss();
        debug!("Cache miss L1 for key: {}", key);

        let Some(shared) = &self.inner.shared else {
            self.inner.stats.record_l2_miss();
            return None;
        };

        match self.bounded(shared.get(key)).await {
            Ok(Some(stored)) => {
                self.inner.stats.record_l2_hit();
                let ttl = stored.ttl.unwrap_or(self.inner.config.l1_backfill_ttl);
                let payload: Arc<[u8]> = stored.payload.into();
                self.inner
                    .local
                    .insert(key, Arc::clone(&payload), ttl)
                    .await;
                debug!("Cache hit L2 for key: {} (L1 backfilled for {:?})", key, ttl);
                Some(payload)
            }
            Ok(None) => {
                self.inner.stats.record_l2_miss();
                debug!("Cache miss L2 for key: {}", key);
                None
            }
            Err(e) => {
                self.inner.stats.record_l2_miss();
                warn!("L2 GET error for key {} ({}). Treating as miss.", key, e);
                None
            }
        }
    }

    async fn store(&self, key: &str, payload: Arc<[u8]>, ttl: Duration) -> TierOutcome {
        self.inner
            .local
            .insert(key, Arc::clone(&payload), ttl)
            .await;

        let Some(shared) = &self.inner.shared else {
            return TierOutcome::Complete;
        };

        match self.bounded(shared.set(key, &payload, ttl)).await {
            Ok(()) => {
                debug!("Cache set (L1+L2) for key: {} ttl {:?}", key, ttl);
                TierOutcome::Complete
            }
            Err(e) => {
                warn!("L2 SET error for key {} ({}). Continuing with L1 only.", key, e);
                TierOutcome::Degraded
            }
        }
    }

    async fn evict(&self, key: &str) -> TierOutcome {
        self.inner.local.remove(key).await;

        let Some(shared) = &self.inner.shared else {
            return TierOutcome::Complete;
        };

        match self.bounded(shared.remove(key)).await {
            Ok(()) => {
                debug!("Cache removed (L1+L2) for key: {}", key);
                TierOutcome::Complete
            }
            Err(e) => {
                warn!("L2 DEL error for key {} ({}). L1 removed only.", key, e);
                TierOutcome::Degraded
            }
        }
    }

    /// Run an L2 call under the configured timeout, counting failures.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let timeout = self.inner.config.l2_timeout;
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };
        if result.is_err() {
            self.inner.stats.record_l2_error();
        }
        result
    }

    async fn compute_coalesced<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let guard = loop {
            let role = {
                let mut in_flight = lock(&self.inner.in_flight);
                match in_flight.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(InFlightState::Pending);
                        in_flight.insert(key.to_owned(), rx);
                        Role::Leader(InFlightGuard::new(
                            key.to_owned(),
                            Arc::clone(&self.inner.in_flight),
                            tx,
                        ))
                    }
                }
            };

            match role {
                Role::Leader(guard) => break guard,
                Role::Waiter(rx) => {
                    debug!("Waiting for in-flight computation for key: {}", key);
                    match wait_for_leader(rx).await {
                        InFlightState::Ready(payload) => match self.inner.codec.decode(&payload) {
                            Ok(value) => return Ok(value),
                            Err(e) => warn!(
                                "Cannot decode in-flight result for key {} ({}). Recomputing.",
                                key, e
                            ),
                        },
                        InFlightState::Failed(e) => return Err(CacheError::Compute(e.into())),
                        InFlightState::Pending | InFlightState::Abandoned => {
                            debug!("In-flight computation for key {} abandoned; retrying", key);
                        }
                    }
                }
            }
        };

        // The guard cleans up even if this future is dropped mid-computation
        let value = match factory().await {
            Ok(value) => value,
            Err(e) => {
                let e: BoxError = e.into();
                error!("Computation failed for key {}: {}", key, e);
                guard.complete(InFlightState::Failed(e.to_string()));
                return Err(CacheError::Compute(e));
            }
        };

        match self.inner.codec.encode(&value) {
            Ok(bytes) => {
                let payload: Arc<[u8]> = bytes.into();
                if ttl.is_zero() {
                    self.evict(key).await;
                } else {
                    self.store(key, Arc::clone(&payload), ttl).await;
                }
                guard.complete(InFlightState::Ready(payload));
            }
            Err(e) => {
                // Waiters fall back to their own factories
                warn!("Failed to cache computed value for key {}: {}", key, e);
                guard.complete(InFlightState::Abandoned);
            }
        }

        Ok(value)
    }
}
