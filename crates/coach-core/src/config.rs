//! Coach Configuration Management
//!
//! Handles configuration from environment variables and TOML config files
//! with sensible defaults for a local knowledge folder layout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::Category;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Watched folders
    pub watch: WatchConfig,

    /// Index store location
    pub store: StoreConfig,

    /// Embedding function
    pub embedding: EmbeddingConfig,

    /// Splitting of long documents into passages
    pub chunking: ChunkingConfig,

    /// Ingestion worker pool
    pub pipeline: PipelineConfig,

    /// Directory-to-category rules
    pub classifier: ClassifierConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_override()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError { path, message },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(paths) = lookup("COACH_WATCH_PATHS") {
            self.watch.roots = paths
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(path) = lookup("COACH_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(collection) = lookup("COACH_COLLECTION") {
            self.store.collection = collection;
        }

        if let Some(provider) = lookup("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.parse()?;
        }
        if let Some(url) = lookup("OLLAMA_HOST") {
            self.embedding.ollama_url = url;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }

        if let Some(workers) = lookup("COACH_WORKERS") {
            self.pipeline.workers = workers.parse().map_err(|_| ConfigError::InvalidValue {
                key: "COACH_WORKERS".to_string(),
                value: workers,
            })?;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.workers".to_string(),
                value: "0".to_string(),
            });
        }
        if self.watch.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "watch.channel_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::InvalidValue {
                key: "embedding.dimension".to_string(),
                value: "0".to_string(),
            });
        }
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chunking.chunk_size".to_string(),
                value: "0".to_string(),
            });
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            return Err(ConfigError::InvalidValue {
                key: "chunking.overlap".to_string(),
                value: self.chunking.overlap.to_string(),
            });
        }
        if self.store.collection.trim().is_empty() {
            return Err(ConfigError::MissingRequired("store.collection".to_string()));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<effective>"),
            message: e.to_string(),
        })
    }
}

/// Watch coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Folders to watch
    pub roots: Vec<PathBuf>,

    /// Quiet period before a pending change is emitted, in milliseconds
    pub debounce_ms: u64,

    /// Capacity of the change event channel
    pub channel_capacity: usize,

    /// Watch subdirectories too
    pub recursive: bool,

    /// Reconcile the index with the folders before watching
    pub initial_scan: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: vec![
                PathBuf::from("data/monitored_folders/job_posts"),
                PathBuf::from("data/knowledge_base/skills"),
            ],
            debounce_ms: 500,
            channel_capacity: 1024,
            recursive: true,
            initial_scan: true,
        }
    }
}

/// Index store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Collection name inside the database
    pub collection: String,

    /// Connection pool size
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/vector_db/index.sqlite"),
            collection: "career_knowledge".to_string(),
            max_connections: 4,
        }
    }
}

/// Embedding function configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which embedding function to bind to the collection
    pub provider: EmbeddingProviderKind,

    /// Ollama server URL
    pub ollama_url: String,

    /// Embedding model name (Ollama)
    pub model: String,

    /// Vector dimension (must match the model)
    pub dimension: usize,

    /// Maximum number of cached embeddings
    pub cache_capacity: u64,

    /// Time-to-live of cached embeddings in seconds
    pub cache_ttl_secs: u64,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hashing,
            ollama_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 384,
            cache_capacity: 10_000,
            cache_ttl_secs: 3600,
            timeout_secs: 30,
        }
    }
}

/// Document chunking configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Split long documents at all
    pub enabled: bool,

    /// Documents with at most this many words are embedded whole
    pub min_words: u64,

    /// Target passage length in characters
    pub chunk_size: usize,

    /// Characters of trailing sentences repeated at the start of the next passage
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_words: 500,
            chunk_size: 500,
            overlap: 50,
        }
    }
}

/// Supported embedding functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Hashing,
    Ollama,
}

impl std::str::FromStr for EmbeddingProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hashing" | "local" => Ok(Self::Hashing),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigError::InvalidValue {
                key: "EMBEDDING_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of events processed concurrently
    pub workers: usize,

    /// Retries after an embedding failure
    pub max_retries: u32,

    /// Base backoff delay in milliseconds (doubled per attempt)
    pub retry_base_ms: u64,

    /// How long ordering state is kept for an idle identity, in seconds
    pub slot_retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_base_ms: 200,
            slot_retention_secs: 600,
        }
    }
}

/// Directory-name to category rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Directory name (case-insensitive) to category
    pub directories: BTreeMap<String, Category>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let directories = [
            ("job_posts", Category::JobDescription),
            ("jobs", Category::JobDescription),
            ("skills", Category::SkillProfile),
            ("cv", Category::Cv),
            ("resume", Category::Cv),
            ("resumes", Category::Cv),
            ("notes", Category::Note),
            ("learning", Category::Note),
            ("logs", Category::Note),
        ]
        .into_iter()
        .map(|(name, category)| (name.to_string(), category))
        .collect();

        Self { directories }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
