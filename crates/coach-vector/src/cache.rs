//! Embedding cache
//!
//! Wraps an embedding function with a concurrent LRU cache (moka) so the
//! same text is not embedded twice while it stays cached. Entries expire
//! after a TTL.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use coach_core::Result;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::embedding::EmbeddingProvider;

// ============================================================================
// Cached Embedding
// ============================================================================

/// Embedding function decorator with an async LRU + TTL cache
///
/// Keeps the inner function's `model_id` and `dimension`, so a cached
/// provider binds to the same collections as the uncached one.
#[derive(Clone)]
pub struct CachedEmbedding {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Cache<u64, Arc<Vec<f32>>>,
    stats: Arc<CacheStats>,
}

impl CachedEmbedding {
    /// Wrap an embedding function
    pub fn new(inner: Arc<dyn EmbeddingProvider>, max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self {
            inner,
            cache,
            stats: Arc::new(CacheStats::new("embedding")),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = hash_text(text);

        if let Some(hit) = self.cache.get(&key).await {
            self.stats.record_hit();
            return Ok(hit.as_ref().clone());
        }
        self.stats.record_miss();

        // Failures are not cached so a retry reaches the inner function
        let vector = self.inner.embed(text).await?;
        self.cache.insert(key, Arc::new(vector.clone())).await;
        self.stats.record_write();
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn cache_stats(&self) -> Option<CacheStatsReport> {
        Some(self.stats.report(self.cache.entry_count()))
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Statistics for cache performance monitoring
#[derive(Debug)]
struct CacheStats {
    /// Cache name for identification
    name: String,
    /// Total number of cache hits
    hits: AtomicU64,
    /// Total number of cache misses
    misses: AtomicU64,
    /// Total number of cache writes
    writes: AtomicU64,
}

impl CacheStats {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters
    fn report(&self, entries: u64) -> CacheStatsReport {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStatsReport {
            name: self.name.clone(),
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            entries,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Serializable cache statistics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsReport {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    /// Approximate number of cached vectors
    pub entries: u64,
    /// Hits over lookups (0.0 - 1.0)
    pub hit_rate: f64,
}

impl std::fmt::Display for CacheStatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cache: {} hits, {} misses, {} writes ({:.1}% hit rate)",
            self.name,
            self.hits,
            self.misses,
            self.writes,
            self.hit_rate * 100.0
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
