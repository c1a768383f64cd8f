//! Coach Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the coach index:
//! - Document categories and indexed document records
//! - Change events emitted by the watch coordinator
//! - The ingestion failure taxonomy and common error types
//! - Directory/content classification
//! - Passage chunking of long documents
//! - Configuration management

pub mod chunker;
pub mod classifier;
pub mod config;

pub use chunker::{Chunker, TextChunk};
pub use classifier::{Classifier, ClassifierRules};
pub use config::{
    AppConfig, ChunkingConfig, ClassifierConfig, ConfigError, EmbeddingConfig,
    EmbeddingProviderKind, LoggingConfig, PipelineConfig, StoreConfig, WatchConfig,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for coach operations
#[derive(Error, Debug)]
pub enum CoachError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    #[error("Embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(
        "Collection '{collection}' is bound to embedding function {stored}, refusing {provided}"
    )]
    EmbeddingMismatch {
        collection: String,
        stored: String,
        provided: String,
    },

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoachError {
    /// Map the error onto the per-identity failure taxonomy, if it belongs to it
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::UnsupportedFormat(_) => Some(FailureKind::UnsupportedFormat),
            Self::CorruptDocument(_) => Some(FailureKind::CorruptDocument),
            Self::EmbeddingFailure(_) => Some(FailureKind::EmbeddingFailure),
            Self::StoreUnavailable(_) => Some(FailureKind::StoreUnavailable),
            _ => None,
        }
    }

    /// Whether the error must stop the ingestion pipeline
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::EmbeddingMismatch { .. }
        )
    }
}

impl From<ConfigError> for CoachError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoachError>;

/// Failure classes reported per identity by the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// File type cannot be parsed at all
    UnsupportedFormat,
    /// Parsing started but the content was malformed
    CorruptDocument,
    /// The embedding function errored (after retries)
    EmbeddingFailure,
    /// The persistence layer could not be reached
    StoreUnavailable,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedFormat => write!(f, "unsupported_format"),
            Self::CorruptDocument => write!(f, "corrupt_document"),
            Self::EmbeddingFailure => write!(f, "embedding_failure"),
            Self::StoreUnavailable => write!(f, "store_unavailable"),
        }
    }
}

// ============================================================================
// Categories
// ============================================================================

/// Coarse document category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    JobDescription,
    Cv,
    SkillProfile,
    Note,
    #[default]
    Unknown,
}

impl Category {
    /// All categories, in classification priority order
    pub const ALL: [Category; 5] = [
        Category::JobDescription,
        Category::Cv,
        Category::SkillProfile,
        Category::Note,
        Category::Unknown,
    ];

    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobDescription => "job_description",
            Self::Cv => "cv",
            Self::SkillProfile => "skill_profile",
            Self::Note => "note",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "job_description" | "job" => Ok(Self::JobDescription),
            "cv" | "resume" => Ok(Self::Cv),
            "skill_profile" | "skills" => Ok(Self::SkillProfile),
            "note" | "notes" => Ok(Self::Note),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ConfigError::InvalidValue {
                key: "category".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Ordering key of a change event: timestamp first, sequence as tie-breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventOrder {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// A normalized change to one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Identity of the affected file
    pub identity: String,

    /// What happened to it
    pub kind: ChangeKind,

    /// When the (latest) notification was observed
    pub timestamp: DateTime<Utc>,

    /// Process-wide monotonically increasing sequence number
    pub sequence: u64,
}

impl ChangeEvent {
    /// Create an event stamped with the current time
    pub fn new(identity: impl Into<String>, kind: ChangeKind) -> Self {
        Self::at(identity, kind, Utc::now())
    }

    /// Create an event with an explicit timestamp
    pub fn at(identity: impl Into<String>, kind: ChangeKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            kind,
            timestamp,
            sequence: EVENT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Event for a filesystem path
    pub fn for_path(path: &Path, kind: ChangeKind) -> Self {
        Self::new(identity_for(path), kind)
    }

    /// Ordering key used to apply events for one identity in order
    pub fn order(&self) -> EventOrder {
        EventOrder {
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Filesystem path named by the identity
    pub fn path(&self) -> &Path {
        Path::new(&self.identity)
    }
}

/// Identity of a source file: its path as a string
pub fn identity_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Document Models
// ============================================================================

/// Metadata extracted for an indexed document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Whitespace-separated word count of the extracted text
    pub word_count: u64,

    /// Source format (text, markdown, pdf, docx)
    pub source_format: String,

    /// File modification timestamp
    pub modified_at: Option<DateTime<Utc>>,

    /// Number of pages, for paged formats
    pub page_count: Option<u32>,

    /// Document title, if one could be derived
    pub title: Option<String>,

    /// File size in bytes
    pub byte_size: u64,
}

impl DocumentMetadata {
    /// Create metadata for a parsed document
    pub fn new(source_format: impl Into<String>, word_count: u64) -> Self {
        Self {
            word_count,
            source_format: source_format.into(),
            ..Default::default()
        }
    }

    /// Set modification time
    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Set page count
    pub fn with_page_count(mut self, page_count: u32) -> Self {
        self.page_count = Some(page_count);
        self
    }

    /// Set title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set byte size
    pub fn with_byte_size(mut self, byte_size: u64) -> Self {
        self.byte_size = byte_size;
        self
    }
}

/// A document as stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Unique identity within the collection
    pub identity: String,

    /// Assigned category
    pub category: Category,

    /// Extracted text
    pub text: String,

    /// Extraction metadata
    pub metadata: DocumentMetadata,

    /// SHA-256 of the text, hex encoded
    pub content_hash: String,

    /// Embedded passages, in document order; at least one
    pub chunks: Vec<DocumentChunk>,

    /// When the record was last written
    pub indexed_at: DateTime<Utc>,
}

/// One embedded passage of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: u32,
    pub heading: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A ranked query result, one per identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub identity: String,
    pub category: Category,
    pub text: String,
    /// Cosine similarity of the best matching passage (higher is better)
    pub score: f32,
    /// Best matching passage
    pub passage: String,
    pub chunk_id: u32,
    pub heading: Option<String>,
    pub metadata: DocumentMetadata,
}

// ============================================================================
// Tests
// ============================================================================
