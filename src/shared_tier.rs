//! L2: the shared tier contract
//!
//! The shared tier is an external, possibly unreachable store. Every call may
//! fail; the layered cache bounds each call with a timeout and degrades
//! failures to misses or partial writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::CacheError;

/// A payload read from the shared tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub payload: Vec<u8>,
    /// Remaining time-to-live, if the store reports one.
    pub ttl: Option<Duration>,
}

/// Raw byte storage shared between processes.
#[async_trait]
pub trait SharedTier: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError>;

    async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remove every entry this tier owns.
    async fn clear(&self) -> Result<(), CacheError>;
}

#[async_trait]
impl<T: SharedTier + ?Sized> SharedTier for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, payload, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        (**self).remove(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        (**self).exists(key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        (**self).clear().await
    }
}

/// How often a write also sweeps expired entries.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// In-process shared tier for single-node deployments and tests.
///
/// Cloning yields a handle to the same map, so two caches built from clones
/// of one `MemorySharedTier` behave like two nodes sharing a store. Expired
/// entries are dropped when read and swept at most once per
/// `PURGE_INTERVAL` on write.
#[derive(Clone)]
pub struct MemorySharedTier {
    entries: Arc<RwLock<Entries>>,
}

struct Entries {
    map: HashMap<String, (Vec<u8>, Instant)>,
    next_purge: Instant,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant) {
        if now < self.next_purge {
            return;
        }
        let before = self.map.len();
        self.map.retain(|_, (_, expires_at)| *expires_at > now);
        self.next_purge = now + PURGE_INTERVAL;
        let purged = before - self.map.len();
        if purged > 0 {
            debug!("In-memory shared tier purged {} expired entries", purged);
        }
    }
}

impl Default for MemorySharedTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySharedTier {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries {
                map: HashMap::new(),
                next_purge: Instant::now() + PURGE_INTERVAL,
            })),
        }
    }

    /// Number of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .map
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SharedTier for MemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.map.get(key) {
                Some((payload, expires_at)) if *expires_at > now => {
                    return Ok(Some(StoredValue {
                        payload: payload.clone(),
                        ttl: Some(expires_at.duration_since(now)),
                    }));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it unless a fresh write raced in.
        let mut entries = self.entries.write().await;
        if entries
            .map
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= now)
        {
            entries.map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let Some(expires_at) = now.checked_add(ttl) else {
            return Err(CacheError::Unavailable(format!("ttl {ttl:?} out of range")));
        };
        let mut entries = self.entries.write().await;
        entries.purge_expired(now);
        entries
            .map
            .insert(key.to_owned(), (payload.to_vec(), expires_at));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.map.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_tier_reports_remaining_ttl() {
        let tier = MemorySharedTier::new();
        tier.set("k", b"v", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        let stored = tier.get("k").await.unwrap().expect("present");
        assert_eq!(stored.payload, b"v");
        assert_eq!(stored.ttl, Some(Duration::from_secs(40)));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(tier.get("k").await.unwrap().is_none());
        assert!(!tier.exists("k").await.unwrap());
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_tier_clones_share_state() {
        let a = MemorySharedTier::new();
        let b = a.clone();
        a.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert!(b.exists("k").await.unwrap());

        b.remove("k").await.unwrap();
        assert!(!a.exists("k").await.unwrap());

        a.set("x", b"1", Duration::from_secs(60)).await.unwrap();
        a.set("y", b"2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.len().await, 2);
        b.clear().await.unwrap();
        assert!(a.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_tier_sweeps_expired_entries_on_write() {
        let tier = MemorySharedTier::new();
        for i in 0..1_000 {
            tier.set(&format!("k{i}"), b"v", Duration::from_secs(1))
                .await
                .unwrap();
        }
        tier.set("keep", b"v", Duration::from_secs(7200)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        tier.set("fresh", b"v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(tier.entries.read().await.map.len(), 2);
        assert_eq!(tier.len().await, 2);
    }
}
