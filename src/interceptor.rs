//! Transparent request caching
//!
//! `CachingBehavior` is a pipeline stage. Requests that expose a
//! [`CacheableDescriptor`] are looked up under
//! `<base_key>:<sha256(request)>`; a hit short-circuits the rest of the
//! pipeline, a miss runs it and stores a successful, cacheable response.
//!
//! Caching is a side channel: any cache failure is logged and the request is
//! served as if the cache were absent. Errors from the wrapped operation are
//! returned untouched and never cached.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::pipeline::{Next, PipelineBehavior};
use crate::{JsonCodec, KeyDeriver, LayeredCache, PayloadCodec};

/// Per-request caching metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheableDescriptor {
    base_key: String,
    ttl: Option<Duration>,
}

impl CacheableDescriptor {
    pub fn new(base_key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            base_key: base_key.into(),
            ttl: Some(ttl),
        }
    }

    /// Use the cache's configured default TTL.
    pub fn with_default_ttl(base_key: impl Into<String>) -> Self {
        Self {
            base_key: base_key.into(),
            ttl: None,
        }
    }

    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

/// Requests opt into caching by returning a descriptor.
pub trait CacheableRequest {
    fn cache_descriptor(&self) -> Option<CacheableDescriptor> {
        None
    }
}

/// Responses that encode a domain failure return `false` so they are not cached.
pub trait CacheableResponse {
    fn is_cacheable(&self) -> bool {
        true
    }
}

/// Pipeline stage that serves and populates the layered cache.
pub struct CachingBehavior<C: PayloadCodec = JsonCodec> {
    cache: LayeredCache<C>,
    deriver: KeyDeriver,
}

impl<C: PayloadCodec> Clone for CachingBehavior<C> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            deriver: self.deriver,
        }
    }
}

impl<C: PayloadCodec> CachingBehavior<C> {
    pub fn new(cache: LayeredCache<C>) -> Self {
        Self {
            cache,
            deriver: KeyDeriver::new(),
        }
    }

    pub fn cache(&self) -> &LayeredCache<C> {
        &self.cache
    }
}

#[async_trait]
impl<Req, Resp, E, C> PipelineBehavior<Req, Resp, E> for CachingBehavior<C>
where
    Req: CacheableRequest + Serialize + Send + Sync + 'static,
    Resp: CacheableResponse + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Send + 'static,
    C: PayloadCodec,
{
    async fn handle(&self, request: Req, next: Next<'_, Req, Resp, E>) -> Result<Resp, E> {
        let Some(descriptor) = request.cache_descriptor() else {
            return next.run(request).await;
        };

        let key = match self.deriver.derive(descriptor.base_key(), &request) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    "Cannot derive cache key under '{}' ({}). Bypassing cache.",
                    descriptor.base_key(),
                    e
                );
                return next.run(request).await;
            }
        };

        match self.cache.get::<Resp>(key.as_str()).await {
            Ok(Some(cached)) => {
                debug!("Request served from cache: {}", key);
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {} ({}). Running handler.", key, e),
        }

        let response = next.run(request).await?;

        if response.is_cacheable() {
            let ttl = descriptor
                .ttl()
                .unwrap_or(self.cache.config().default_ttl);
            if let Err(e) = self.cache.set(key.as_str(), &response, ttl).await {
                warn!("Failed to cache response for {}: {}", key, e);
            }
        } else {
            debug!("Response for {} marked non-cacheable; not stored", key);
        }

        Ok(response)
    }
}
