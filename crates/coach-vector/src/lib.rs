//! Coach Vector - Semantic index abstraction
//!
//! Provides the `IndexStore` contract (upsert / delete / top-k query keyed by
//! identity), the pluggable embedding function seam, and a durable SQLite
//! implementation. Long documents are stored as several embedded passages;
//! queries rank identities by their best passage.

use async_trait::async_trait;
use coach_core::{Category, DocumentMetadata, DocumentRecord, QueryMatch, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub mod cache;
pub mod embedding;
pub mod sqlite_store;

pub use cache::{CacheStatsReport, CachedEmbedding};
pub use embedding::{create_embedding_provider, EmbeddingProvider, HashingEmbedding, OllamaEmbedding};
pub use sqlite_store::SqliteIndexStore;

/// Trait for index store operations
///
/// Every record is keyed by identity; writes for one identity replace the
/// previous record and all of its passages. All records of a store share
/// one embedding function.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Compute or reuse the embedding and store/replace the record
    async fn upsert(
        &self,
        identity: &str,
        text: &str,
        category: Category,
        metadata: DocumentMetadata,
    ) -> Result<DocumentRecord>;

    /// Remove all records for an identity, returning how many were removed
    async fn delete(&self, identity: &str) -> Result<u64>;

    /// Top-k records most similar to the text, optionally within one category
    async fn query(
        &self,
        text: &str,
        k: usize,
        category: Option<Category>,
    ) -> Result<Vec<QueryMatch>>;

    /// Fetch one record by identity
    async fn get(&self, identity: &str) -> Result<Option<DocumentRecord>>;

    /// All indexed identities, sorted
    async fn identities(&self) -> Result<Vec<String>>;

    /// Indexed identities that lie under a directory, sorted
    async fn identities_under(&self, dir: &str) -> Result<Vec<String>>;

    /// Collection statistics
    async fn stats(&self) -> Result<StoreStats>;

    /// Hit statistics of the embedding cache, when one is in use
    fn embedding_cache(&self) -> Option<CacheStatsReport> {
        None
    }
}

/// Summary of an index collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub collection: String,
    pub embedding_model: String,
    pub dimension: usize,
    pub total: u64,
    /// Embedded passages across all records
    pub chunks: u64,
    /// Record count per category, in category priority order
    pub by_category: Vec<(Category, u64)>,
}

/// Cosine similarity between two vectors; 0.0 when either has no magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank candidates: documents with text first, then descending score,
/// then more words, then identity ascending. Keeps the top `k`.
pub fn rank_matches(mut matches: Vec<QueryMatch>, k: usize) -> Vec<QueryMatch> {
    matches.sort_by(|a, b| {
        let a_empty = a.metadata.word_count == 0;
        let b_empty = b.metadata.word_count == 0;
        a_empty
            .cmp(&b_empty)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then_with(|| b.metadata.word_count.cmp(&a.metadata.word_count))
            .then_with(|| a.identity.cmp(&b.identity))
    });
    matches.truncate(k);
    matches
}
