//! L1: process-local Moka tier
//!
//! Entries carry their own absolute expiry. Moka evicts them on its own
//! schedule (and under capacity pressure); reads also check the expiry
//! against `tokio::time::Instant` so an entry is never served past its
//! deadline even before Moka gets around to dropping it.

use std::sync::Arc;
use std::time::Duration;

use moka::Expiry;
use moka::future::Cache;
use tokio::time::Instant;

/// Used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// A stored payload with its insertion and expiry instants.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    payload: Arc<[u8]>,
    inserted_at: Instant,
    expires_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    pub fn new(payload: Arc<[u8]>, ttl: Duration) -> Self {
        let inserted_at = Instant::now();
        let expires_at = inserted_at
            .checked_add(ttl)
            .unwrap_or_else(|| inserted_at + FAR_FUTURE);
        Self {
            payload,
            inserted_at,
            expires_at,
            ttl,
        }
    }

    pub fn payload(&self) -> &Arc<[u8]> {
        &self.payload
    }

    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Per-entry expiration policy for Moka.
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl.min(FAR_FUTURE))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl.min(FAR_FUTURE))
    }
}

/// Process-local tier. Never fails; capacity eviction looks like a miss.
#[derive(Clone)]
pub struct LocalTier {
    cache: Cache<String, CacheEntry>,
}

impl LocalTier {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();

        Self { cache }
    }

    /// Get an unexpired entry. Expired entries are left for Moka to drop.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.cache.get(key).await?;
        (!entry.is_expired()).then_some(entry)
    }

    pub async fn insert(&self, key: &str, payload: Arc<[u8]>, ttl: Duration) {
        self.cache
            .insert(key.to_owned(), CacheEntry::new(payload, ttl))
            .await;
    }

    pub async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Approximate number of entries (Moka applies writes lazily).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending maintenance so `entry_count` is exact.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_at_deadline() {
        let tier = LocalTier::new(100);
        tier.insert("k", bytes("v"), Duration::from_secs(10)).await;

        let entry = tier.get("k").await.expect("fresh entry");
        assert_eq!(&**entry.payload(), b"v");
        assert_eq!(entry.remaining_ttl(), Duration::from_secs(10));
        assert!(entry.expires_at() > entry.inserted_at());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tier.get("k").await.is_none());
        assert!(!tier.contains("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_read_leaves_removal_to_moka() {
        let tier = LocalTier::new(100);
        tier.insert("k", bytes("old"), Duration::from_secs(5)).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(tier.get("k").await.is_none());
        // The read only filters; removal stays with moka's own expiry
        assert!(tier.cache.contains_key("k"));

        tier.insert("k", bytes("new"), Duration::from_secs(60)).await;
        assert_eq!(&**tier.get("k").await.unwrap().payload(), b"new");
    }

    #[tokio::test]
    async fn test_zero_ttl_is_never_served() {
        let tier = LocalTier::new(100);
        tier.insert("k", bytes("v"), Duration::ZERO).await;
        assert!(tier.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_whole_entry() {
        let tier = LocalTier::new(100);
        tier.insert("k", bytes("first"), Duration::from_secs(60)).await;
        tier.insert("k", bytes("second"), Duration::from_secs(60)).await;
        assert_eq!(&**tier.get("k").await.unwrap().payload(), b"second");
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let tier = LocalTier::new(100);
        tier.insert("a", bytes("1"), Duration::from_secs(60)).await;
        tier.insert("b", bytes("2"), Duration::from_secs(60)).await;

        tier.remove("a").await;
        assert!(tier.get("a").await.is_none());
        assert!(tier.contains("b").await);

        tier.clear();
        assert!(tier.get("b").await.is_none());
        tier.run_pending_tasks().await;
        assert_eq!(tier.entry_count(), 0);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = CacheEntry::new(bytes("v"), Duration::MAX);
        assert!(!entry.is_expired());
    }
}
