//! End-to-end request caching through a pipeline backed by both tiers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiercache::pipeline::RequestHandler;
use tiercache::{
    CacheConfig, CacheableDescriptor, CacheableRequest, CacheableResponse, CachingBehavior,
    LayeredCache, LoggingBehavior, MemorySharedTier, Pipeline, async_trait,
};
use uuid::Uuid;

const PRODUCT_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize)]
struct GetProduct {
    id: Uuid,
}

impl CacheableRequest for GetProduct {
    fn cache_descriptor(&self) -> Option<CacheableDescriptor> {
        Some(CacheableDescriptor::new(
            format!("product:{}", self.id),
            PRODUCT_TTL,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProductView {
    id: Uuid,
    name: String,
    price_cents: u64,
    revision: usize,
}

impl CacheableResponse for ProductView {}

#[derive(Debug, thiserror::Error)]
#[error("product {0} not found")]
struct NotFound(Uuid);

/// Builds a projection and counts how often it had to.
struct ProductProjection {
    builds: Arc<AtomicUsize>,
}

#[async_trait]
impl RequestHandler<GetProduct, ProductView, NotFound> for ProductProjection {
    async fn handle(&self, request: GetProduct) -> Result<ProductView, NotFound> {
        if request.id.is_nil() {
            return Err(NotFound(request.id));
        }
        let revision = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProductView {
            id: request.id,
            name: "Espresso machine".to_owned(),
            price_cents: 24_900,
            revision,
        })
    }
}

fn product_pipeline(
    cache: LayeredCache,
) -> (Pipeline<GetProduct, ProductView, NotFound>, Arc<AtomicUsize>) {
    let builds = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(ProductProjection {
        builds: Arc::clone(&builds),
    })
    .with(LoggingBehavior)
    .with(CachingBehavior::new(cache))
    .build();
    (pipeline, builds)
}

#[tokio::test(start_paused = true)]
async fn test_product_projection_is_cached_until_expiry() {
    let id = Uuid::parse_str("123e4567-e89b-12d3-a456-426614174000").unwrap();
    let cache = LayeredCache::new(MemorySharedTier::new(), CacheConfig::default());
    let (pipeline, builds) = product_pipeline(cache.clone());

    let first = pipeline.send(GetProduct { id }).await.unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    let second = pipeline.send(GetProduct { id }).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    let third = pipeline.send(GetProduct { id }).await.unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(third.revision, 2);

    let stats = cache.statistics().await;
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.l1_misses, 2);
    assert_eq!(stats.l1_entries, 1);
}

#[tokio::test]
async fn test_second_node_reads_projection_from_shared_tier() {
    let shared = MemorySharedTier::new();
    let node_a = LayeredCache::new(shared.clone(), CacheConfig::default());
    let node_b = LayeredCache::new(shared, CacheConfig::default());
    let (pipeline_a, builds_a) = product_pipeline(node_a);
    let (pipeline_b, builds_b) = product_pipeline(node_b.clone());

    let id = Uuid::new_v4();
    let from_a = pipeline_a.send(GetProduct { id }).await.unwrap();
    let from_b = pipeline_b.send(GetProduct { id }).await.unwrap();

    assert_eq!(from_a, from_b);
    assert_eq!(builds_a.load(Ordering::SeqCst), 1);
    assert_eq!(builds_b.load(Ordering::SeqCst), 0);
    assert_eq!(node_b.statistics().await.l2_hits, 1);
}

#[tokio::test]
async fn test_handler_errors_reach_the_caller() {
    let cache = LayeredCache::local_only(CacheConfig::default());
    let (pipeline, _) = product_pipeline(cache.clone());

    let err = pipeline
        .send(GetProduct { id: Uuid::nil() })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), format!("product {} not found", Uuid::nil()));
    assert_eq!(cache.statistics().await.l1_entries, 0);
}
