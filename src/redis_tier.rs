//! L2 over Redis
//!
//! Keys are namespaced with a prefix so `clear` can remove exactly this
//! cache's entries (SCAN + DEL) without flushing the database.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::{CacheError, SharedTier, StoredValue};

const SCAN_BATCH: usize = 500;

/// Shared tier backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisTier {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisTier {
    /// Connect and namespace every key under `prefix` (e.g. `"cache:"`).
    pub async fn new(
        redis_client: redis::Client,
        prefix: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let redis = ConnectionManager::new(redis_client).await?;
        Ok(Self {
            redis,
            prefix: prefix.into(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl SharedTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.redis.clone();

        let (payload, pttl): (Option<Vec<u8>>, i64) = get_with_ttl(&redis_key)
            .query_async(&mut conn)
            .await?;

        Ok(payload.map(|payload| StoredValue {
            payload,
            ttl: remaining_ttl(pttl),
        }))
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.redis.clone();

        if ttl.is_zero() {
            conn.del::<_, ()>(&redis_key).await?;
            return Ok(());
        }

        conn.pset_ex::<_, _, ()>(&redis_key, payload, ttl_millis(ttl))
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.redis_key(key)).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists::<_, bool>(self.redis_key(key)).await?)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", glob_escape(&self.prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                conn.del::<_, ()>(keys).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("L2 (Redis) cleared {} keys matching {}", removed, pattern);
        Ok(())
    }
}

/// GET and PTTL in one MULTI/EXEC so the TTL belongs to the value read.
fn get_with_ttl(redis_key: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic().get(redis_key).pttl(redis_key);
    pipe
}

/// PTTL returns -2 for a missing key and -1 for a key without expiry.
fn remaining_ttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Sub-millisecond TTLs round up so the write is not rejected by Redis.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn glob_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
