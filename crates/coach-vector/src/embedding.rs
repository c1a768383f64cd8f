//! Embedding functions for generating vector representations
//!
//! Supports a local feature-hashing embedder and the Ollama embedding API.
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coach_core::{CoachError, EmbeddingConfig, EmbeddingProviderKind, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::{CacheStatsReport, CachedEmbedding};

// ============================================================================
// Embedding Trait
// ============================================================================

/// Trait for embedding generation
///
/// A provider is bound to an index collection for its whole lifetime; the
/// `model_id` and `dimension` pair identifies it in persisted collections.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get embedding dimension
    fn dimension(&self) -> usize;

    /// Stable identifier of the embedding function
    fn model_id(&self) -> &str;

    /// Cache statistics, for functions wrapped in a cache
    fn cache_stats(&self) -> Option<CacheStatsReport> {
        None
    }
}

// ============================================================================
// Hashing Embedding
// ============================================================================

/// Deterministic bag-of-words embedding using the hashing trick
///
/// Tokens are lowercased alphanumeric runs; each increments one bucket
/// chosen by its SHA-256 digest. The vector is L2-normalized, so texts
/// sharing vocabulary score higher under cosine similarity. Blank text
/// yields the zero vector.
pub struct HashingEmbedding {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedding {
    /// Create a hashing embedder with the given dimension
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hashing-v1-{dimension}"),
        }
    }

    /// Compute the vector synchronously
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            vector[index] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Ollama Embedding Client
// ============================================================================

/// Ollama embedding API client
pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    model_id: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedding {
    /// Create a new Ollama embedding client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self::with_client(Client::new(), base_url, model, dimension)
    }

    fn with_client(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        let model = model.into();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_id: format!("ollama/{model}"),
            model,
            dimension,
        }
    }

    /// Known output dimension of common embedding models
    pub fn dimension_for_model(model: &str) -> Option<usize> {
        match model.split(':').next().unwrap_or(model) {
            "nomic-embed-text" => Some(768),
            "mxbai-embed-large" => Some(1024),
            "all-minilm" => Some(384),
            _ => None,
        }
    }

    /// Create from config
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CoachError::ConfigError(format!("HTTP client setup failed: {e}")))?;

        let dimension = Self::dimension_for_model(&config.model).unwrap_or(config.dimension);
        Ok(Self::with_client(
            client,
            config.ollama_url.clone(),
            config.model.clone(),
            dimension,
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                CoachError::EmbeddingFailure(format!("Ollama embedding request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CoachError::EmbeddingFailure(format!(
                "Ollama embedding error: {error_text}"
            )));
        }

        let result: OllamaEmbeddingResponse = response.json().await.map_err(|e| {
            CoachError::EmbeddingFailure(format!("Failed to parse embedding response: {e}"))
        })?;

        Ok(result.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create the embedding function described by the config
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedding::new(config.dimension)),
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedding::from_config(config)?),
    };

    if config.cache_capacity == 0 {
        return Ok(provider);
    }

    Ok(Arc::new(CachedEmbedding::new(
        provider,
        config.cache_capacity,
        Duration::from_secs(config.cache_ttl_secs),
    )))
}

// ============================================================================
// Tests
// ============================================================================
