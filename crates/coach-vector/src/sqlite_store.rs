//! SQLite implementation of the index store
//!
//! Records, their passages and the passage embedding vectors live in a
//! single SQLite file, so the index survives restarts. Similarity is
//! computed in process; a record scores as its best passage.
//!
//! Author: hephaex@gmail.com

use std::collections::HashMap;
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_core::{
    Category, Chunker, CoachError, DocumentChunk, DocumentMetadata, DocumentRecord, QueryMatch,
    Result, StoreConfig,
};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;

use crate::cache::CacheStatsReport;
use crate::embedding::EmbeddingProvider;
use crate::{cosine_similarity, rank_matches, IndexStore, StoreStats};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS collections (
        name TEXT PRIMARY KEY,
        embedding_model TEXT NOT NULL,
        dimension INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        identity TEXT NOT NULL,
        category TEXT NOT NULL,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        source_format TEXT NOT NULL,
        word_count INTEGER NOT NULL,
        page_count INTEGER,
        title TEXT,
        byte_size INTEGER NOT NULL,
        modified_at TEXT,
        indexed_at TEXT NOT NULL,
        chunk_count INTEGER NOT NULL,
        PRIMARY KEY (collection, identity)
    )",
    "CREATE INDEX IF NOT EXISTS idx_documents_category ON documents (collection, category)",
    "CREATE TABLE IF NOT EXISTS chunks (
        collection TEXT NOT NULL,
        identity TEXT NOT NULL,
        chunk_id INTEGER NOT NULL,
        heading TEXT,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        PRIMARY KEY (collection, identity, chunk_id)
    )",
];

/// SQLite-backed index store bound to one collection and one embedding function
pub struct SqliteIndexStore {
    pool: SqlitePool,
    collection: String,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
}

impl SqliteIndexStore {
    /// Open (or create) the store and bind the embedding function to the collection
    ///
    /// Fails with `EmbeddingMismatch` if the collection was created with a
    /// different embedding model or dimension.
    pub async fn open(config: &StoreConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoachError::StoreUnavailable(format!(
                    "Failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let pool = connect(&config.path, config.max_connections).await?;
        let store = Self {
            pool,
            collection: config.collection.clone(),
            embedder,
            chunker: Chunker::default(),
        };

        store.init_schema().await?;
        store.bind_collection().await?;

        tracing::info!(
            path = %config.path.display(),
            collection = %store.collection,
            model = store.embedder.model_id(),
            "Index store opened"
        );
        Ok(store)
    }

    /// Set how documents are split into passages
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// Close the connection pool; later operations fail with `StoreUnavailable`
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Collection name
    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| CoachError::StoreUnavailable(format!("Failed to create schema: {e}")))?;
        }
        Ok(())
    }

    async fn bind_collection(&self) -> Result<()> {
        let model = self.embedder.model_id();
        let dimension = self.embedder.dimension();

        sqlx::query(
            "INSERT OR IGNORE INTO collections (name, embedding_model, dimension, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&self.collection)
        .bind(model)
        .bind(dimension as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to register collection: {e}")))?;

        let (stored_model, stored_dimension): (String, i64) = sqlx::query_as(
            "SELECT embedding_model, dimension FROM collections WHERE name = ?",
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to read collection: {e}")))?;

        if stored_model != model || stored_dimension != dimension as i64 {
            return Err(CoachError::EmbeddingMismatch {
                collection: self.collection.clone(),
                stored: format!("{stored_model} ({stored_dimension}d)"),
                provided: format!("{model} ({dimension}d)"),
            });
        }
        Ok(())
    }

    /// Embed text, rejecting vectors of the wrong length
    async fn embed_checked(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embedder.embed(text).await?;
        if vector.len() != self.embedder.dimension() {
            return Err(CoachError::EmbeddingFailure(format!(
                "{} returned {} values, expected {}",
                self.embedder.model_id(),
                vector.len(),
                self.embedder.dimension()
            )));
        }
        Ok(vector)
    }

    /// Stored passage vectors of an identity, keyed by passage hash
    async fn reusable_embeddings(&self, identity: &str) -> Result<HashMap<String, Vec<f32>>> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT content_hash, embedding FROM chunks WHERE collection = ? AND identity = ?",
        )
        .bind(&self.collection)
        .bind(identity)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to read chunks: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(hash, blob)| (hash, decode_vector(&blob)))
            .filter(|(_, vector)| vector.len() == self.embedder.dimension())
            .collect())
    }

    /// Split the text into passages and embed each, reusing stored vectors
    async fn embed_passages(&self, identity: &str, text: &str) -> Result<Vec<DocumentChunk>> {
        let passages = self.chunker.chunk(text);
        let reusable = self.reusable_embeddings(identity).await?;
        let mut reused = 0usize;

        let mut chunks = Vec::with_capacity(passages.len());
        for passage in passages {
            let embedding = if passage.text.trim().is_empty() {
                // Blank passages carry no semantics; skip the embedding function
                vec![0.0; self.embedder.dimension()]
            } else if let Some(vector) = reusable.get(&content_hash(&passage.text)) {
                reused += 1;
                vector.clone()
            } else {
                self.embed_checked(&passage.text).await?
            };

            chunks.push(DocumentChunk {
                chunk_id: passage.index,
                heading: passage.heading,
                text: passage.text,
                embedding,
            });
        }

        if reused > 0 {
            tracing::debug!(identity, reused, total = chunks.len(), "Reusing stored embeddings");
        }
        Ok(chunks)
    }

    async fn load_chunks(&self, identity: &str) -> Result<Vec<DocumentChunk>> {
        let rows: Vec<(i64, Option<String>, String, Vec<u8>)> = sqlx::query_as(
            "SELECT chunk_id, heading, content, embedding FROM chunks \
             WHERE collection = ? AND identity = ? ORDER BY chunk_id",
        )
        .bind(&self.collection)
        .bind(identity)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to read chunks: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(chunk_id, heading, text, blob)| DocumentChunk {
                chunk_id: chunk_id.max(0) as u32,
                heading,
                text,
                embedding: decode_vector(&blob),
            })
            .collect())
    }
}

async fn connect(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("SQLite connection failed: {e}")))
}

/// SHA-256 of the text, hex encoded
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Directory prefix that only matches paths strictly below `dir`
fn directory_prefix(dir: &str) -> String {
    if dir.ends_with(MAIN_SEPARATOR) {
        dir.to_string()
    } else {
        format!("{dir}{MAIN_SEPARATOR}")
    }
}

/// Document row from database
#[derive(Debug, FromRow)]
struct DocumentRow {
    identity: String,
    category: String,
    content: String,
    content_hash: String,
    source_format: String,
    word_count: i64,
    page_count: Option<i64>,
    title: Option<String>,
    byte_size: i64,
    modified_at: Option<DateTime<Utc>>,
    indexed_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_record(self, chunks: Vec<DocumentChunk>) -> DocumentRecord {
        DocumentRecord {
            identity: self.identity,
            category: self.category.parse().unwrap_or_default(),
            text: self.content,
            metadata: DocumentMetadata {
                word_count: self.word_count.max(0) as u64,
                source_format: self.source_format,
                modified_at: self.modified_at,
                page_count: self.page_count.map(|n| n.max(0) as u32),
                title: self.title,
                byte_size: self.byte_size.max(0) as u64,
            },
            content_hash: self.content_hash,
            chunks,
            indexed_at: self.indexed_at,
        }
    }
}

/// Passage row joined with its document's metadata
#[derive(Debug, FromRow)]
struct PassageRow {
    identity: String,
    chunk_id: i64,
    heading: Option<String>,
    passage: String,
    embedding: Vec<u8>,
    category: String,
    source_format: String,
    word_count: i64,
    page_count: Option<i64>,
    title: Option<String>,
    byte_size: i64,
    modified_at: Option<DateTime<Utc>>,
}

impl PassageRow {
    fn into_match(self, score: f32) -> QueryMatch {
        QueryMatch {
            identity: self.identity,
            category: self.category.parse().unwrap_or_default(),
            text: String::new(),
            score,
            passage: self.passage,
            chunk_id: self.chunk_id.max(0) as u32,
            heading: self.heading,
            metadata: DocumentMetadata {
                word_count: self.word_count.max(0) as u64,
                source_format: self.source_format,
                modified_at: self.modified_at,
                page_count: self.page_count.map(|n| n.max(0) as u32),
                title: self.title,
                byte_size: self.byte_size.max(0) as u64,
            },
        }
    }
}

const SELECT_DOCUMENT: &str = "SELECT identity, category, content, content_hash, source_format, \
     word_count, page_count, title, byte_size, modified_at, indexed_at \
     FROM documents";

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(
        &self,
        identity: &str,
        text: &str,
        category: Category,
        metadata: DocumentMetadata,
    ) -> Result<DocumentRecord> {
        let hash = content_hash(text);
        let chunks = self.embed_passages(identity, text).await?;
        let indexed_at = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to begin upsert: {e}")))?;

        sqlx::query(
            "INSERT INTO documents (collection, identity, category, content, content_hash, \
                 source_format, word_count, page_count, title, byte_size, modified_at, indexed_at, chunk_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (collection, identity) DO UPDATE SET \
                 category = excluded.category, \
                 content = excluded.content, \
                 content_hash = excluded.content_hash, \
                 source_format = excluded.source_format, \
                 word_count = excluded.word_count, \
                 page_count = excluded.page_count, \
                 title = excluded.title, \
                 byte_size = excluded.byte_size, \
                 modified_at = excluded.modified_at, \
                 indexed_at = excluded.indexed_at, \
                 chunk_count = excluded.chunk_count",
        )
        .bind(&self.collection)
        .bind(identity)
        .bind(category.as_str())
        .bind(text)
        .bind(&hash)
        .bind(&metadata.source_format)
        .bind(metadata.word_count as i64)
        .bind(metadata.page_count.map(i64::from))
        .bind(metadata.title.as_deref())
        .bind(metadata.byte_size as i64)
        .bind(metadata.modified_at)
        .bind(indexed_at)
        .bind(chunks.len() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to upsert document: {e}")))?;

        sqlx::query("DELETE FROM chunks WHERE collection = ? AND identity = ?")
            .bind(&self.collection)
            .bind(identity)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to replace chunks: {e}")))?;

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks (collection, identity, chunk_id, heading, content, content_hash, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&self.collection)
            .bind(identity)
            .bind(i64::from(chunk.chunk_id))
            .bind(chunk.heading.as_deref())
            .bind(&chunk.text)
            .bind(content_hash(&chunk.text))
            .bind(encode_vector(&chunk.embedding))
            .execute(&mut *tx)
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to store chunk: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to commit upsert: {e}")))?;

        Ok(DocumentRecord {
            identity: identity.to_string(),
            category,
            text: text.to_string(),
            metadata,
            content_hash: hash,
            chunks,
            indexed_at,
        })
    }

    async fn delete(&self, identity: &str) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to begin delete: {e}")))?;

        sqlx::query("DELETE FROM chunks WHERE collection = ? AND identity = ?")
            .bind(&self.collection)
            .bind(identity)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to delete chunks: {e}")))?;

        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND identity = ?")
            .bind(&self.collection)
            .bind(identity)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to delete document: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to commit delete: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        category: Option<Category>,
    ) -> Result<Vec<QueryMatch>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embed_checked(text).await?;
        let category_filter = category.map(|c| c.as_str());

        let rows: Vec<PassageRow> = sqlx::query_as(
            "SELECT c.identity, c.chunk_id, c.heading, c.content AS passage, c.embedding, \
                 d.category, d.source_format, d.word_count, d.page_count, d.title, d.byte_size, d.modified_at \
             FROM chunks c \
             JOIN documents d ON d.collection = c.collection AND d.identity = c.identity \
             WHERE c.collection = ? AND (? IS NULL OR d.category = ?)",
        )
        .bind(&self.collection)
        .bind(category_filter)
        .bind(category_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to scan chunks: {e}")))?;

        // One candidate per identity: its best passage
        let mut best: HashMap<String, QueryMatch> = HashMap::new();
        for row in rows {
            let score = cosine_similarity(&query_vector, &decode_vector(&row.embedding));
            let better = best.get(&row.identity).map_or(true, |current| {
                score > current.score
                    || (score == current.score && (row.chunk_id.max(0) as u32) < current.chunk_id)
            });
            if better {
                best.insert(row.identity.clone(), row.into_match(score));
            }
        }

        let mut matches = rank_matches(best.into_values().collect(), k);
        for m in &mut matches {
            let content: Option<(String,)> = sqlx::query_as(
                "SELECT content FROM documents WHERE collection = ? AND identity = ?",
            )
            .bind(&self.collection)
            .bind(&m.identity)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoachError::StoreUnavailable(format!("Failed to read document: {e}")))?;
            if let Some((content,)) = content {
                m.text = content;
            }
        }
        Ok(matches)
    }

    async fn get(&self, identity: &str) -> Result<Option<DocumentRecord>> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "{SELECT_DOCUMENT} WHERE collection = ? AND identity = ?"
        ))
        .bind(&self.collection)
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to get document: {e}")))?;

        match row {
            Some(row) => {
                let chunks = self.load_chunks(identity).await?;
                Ok(Some(row.into_record(chunks)))
            }
            None => Ok(None),
        }
    }

    async fn identities(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT identity FROM documents WHERE collection = ? ORDER BY identity",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to list identities: {e}")))?;

        Ok(rows.into_iter().map(|(identity,)| identity).collect())
    }

    async fn identities_under(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = directory_prefix(dir);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT identity FROM documents \
             WHERE collection = ? AND substr(identity, 1, length(?)) = ? \
             ORDER BY identity",
        )
        .bind(&self.collection)
        .bind(&prefix)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to list identities: {e}")))?;

        Ok(rows.into_iter().map(|(identity,)| identity).collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT category, COUNT(*), COALESCE(SUM(chunk_count), 0) FROM documents \
             WHERE collection = ? GROUP BY category",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoachError::StoreUnavailable(format!("Failed to count documents: {e}")))?;

        let by_category: Vec<(Category, u64)> = Category::ALL
            .iter()
            .map(|category| {
                let count = rows
                    .iter()
                    .filter(|(name, _, _)| name.parse::<Category>().unwrap_or_default() == *category)
                    .map(|(_, n, _)| (*n).max(0) as u64)
                    .sum();
                (*category, count)
            })
            .collect();

        Ok(StoreStats {
            collection: self.collection.clone(),
            embedding_model: self.embedder.model_id().to_string(),
            dimension: self.embedder.dimension(),
            total: by_category.iter().map(|(_, n)| n).sum(),
            chunks: rows.iter().map(|(_, _, n)| (*n).max(0) as u64).sum(),
            by_category,
        })
    }

    fn embedding_cache(&self) -> Option<CacheStatsReport> {
        self.embedder.cache_stats()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedEmbedding;
    use crate::embedding::HashingEmbedding;
    use coach_core::ChunkingConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("index").join("index.sqlite"),
            collection: "career_knowledge".to_string(),
            max_connections: 2,
        }
    }

    async fn open(dir: &TempDir) -> SqliteIndexStore {
        SqliteIndexStore::open(&config(dir), Arc::new(HashingEmbedding::new(128)))
            .await
            .unwrap()
    }

    fn meta(text: &str) -> DocumentMetadata {
        DocumentMetadata::new("text", text.split_whitespace().count() as u64)
    }

    async fn put(store: &SqliteIndexStore, identity: &str, text: &str, category: Category) {
        store.upsert(identity, text, category, meta(text)).await.unwrap();
    }

    struct CountingEmbedding {
        inner: HashingEmbedding,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    struct ShortEmbedding;

    #[async_trait]
    impl EmbeddingProvider for ShortEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0; 3])
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model_id(&self) -> &str {
            "short"
        }
    }

    #[test]
    fn test_vector_encoding() {
        let vector = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&vector)), vector);
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[tokio::test]
    async fn test_upsert_then_query_ranks_self_first() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let jd = "Senior Rust engineer building kafka streaming pipelines";
        put(&store, "jobs/a.txt", jd, Category::JobDescription).await;
        put(&store, "skills/b.md", "Watercolor and oil painting", Category::SkillProfile).await;
        put(&store, "notes/c.txt", "Notes on rust lifetimes", Category::Note).await;

        let results = store.query(jd, 3, None).await.unwrap();
        assert_eq!(results[0].identity, "jobs/a.txt");
        assert!((results[0].score - 1.0).abs() < 1e-4);
        assert_eq!(results[0].category, Category::JobDescription);
    }

    #[tokio::test]
    async fn test_upsert_replaces_record() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        put(&store, "a.txt", "first version", Category::Note).await;
        put(&store, "a.txt", "second version here", Category::Cv).await;

        assert_eq!(store.identities().await.unwrap(), vec!["a.txt".to_string()]);
        let record = store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.text, "second version here");
        assert_eq!(record.category, Category::Cv);
        assert_eq!(record.metadata.word_count, 3);
        assert_eq!(record.chunks.len(), 1);
        assert_eq!(record.chunks[0].embedding.len(), 128);
    }

    #[tokio::test]
    async fn test_delete_removes_and_is_noop_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        put(&store, "a.txt", "rust developer", Category::Cv).await;
        assert_eq!(store.delete("a.txt").await.unwrap(), 1);
        assert_eq!(store.delete("a.txt").await.unwrap(), 0);

        let results = store.query("rust developer", 10, None).await.unwrap();
        assert!(results.iter().all(|m| m.identity != "a.txt"));
        assert!(store.get("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_category_filter_and_k() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        put(&store, "a.txt", "rust rust rust", Category::SkillProfile).await;
        put(&store, "b.txt", "rust engineer wanted", Category::JobDescription).await;
        put(&store, "c.txt", "rust notes", Category::Note).await;

        let jobs = store
            .query("rust", 10, Some(Category::JobDescription))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].identity, "b.txt");

        assert!(store.query("rust", 0, None).await.unwrap().is_empty());
        assert_eq!(store.query("rust", 2, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_document_never_outranks_content() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        store
            .upsert("test.txt", "", Category::Unknown, DocumentMetadata::new("text", 0))
            .await
            .unwrap();
        put(&store, "cv.txt", "Data engineer with airflow experience", Category::Cv).await;

        let results = store.query("marine biology", 10, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].identity, "test.txt");
        assert_eq!(results[1].score, 0.0);

        let empty = store.get("test.txt").await.unwrap().unwrap();
        assert_eq!(empty.text, "");
        assert_eq!(empty.metadata.word_count, 0);
    }

    #[tokio::test]
    async fn test_unchanged_content_reuses_embedding() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(CountingEmbedding {
            inner: HashingEmbedding::new(128),
            calls: AtomicUsize::new(0),
        });
        let store = SqliteIndexStore::open(&config(&dir), embedder.clone())
            .await
            .unwrap();

        put(&store, "a.txt", "same text", Category::Note).await;
        put(&store, "a.txt", "same text", Category::Note).await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        put(&store, "a.txt", "changed text", Category::Note).await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_durable_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            put(&store, "a.txt", "persisted resume text", Category::Cv).await;
            store.close().await;
        }

        let store = open(&dir).await;
        let record = store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.text, "persisted resume text");
        assert_eq!(record.category, Category::Cv);
    }

    #[tokio::test]
    async fn test_mismatched_embedder_rejected() {
        let dir = TempDir::new().unwrap();
        open(&dir).await.close().await;

        let result =
            SqliteIndexStore::open(&config(&dir), Arc::new(HashingEmbedding::new(64))).await;
        assert!(matches!(result, Err(CoachError::EmbeddingMismatch { .. })));

        // A different collection in the same file may bind another function
        let mut other = config(&dir);
        other.collection = "scratch".to_string();
        assert!(SqliteIndexStore::open(&other, Arc::new(HashingEmbedding::new(64)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_wrong_vector_length_is_embedding_failure() {
        let dir = TempDir::new().unwrap();
        let store = SqliteIndexStore::open(&config(&dir), Arc::new(ShortEmbedding))
            .await
            .unwrap();

        let err = store
            .upsert("a.txt", "text", Category::Note, meta("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::EmbeddingFailure(_)));
        assert!(store.get("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_store_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.close().await;

        let err = store.delete("a.txt").await.unwrap_err();
        assert!(matches!(err, CoachError::StoreUnavailable(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_stats_counts_per_category() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        put(&store, "a.txt", "one", Category::Cv).await;
        put(&store, "b.txt", "two", Category::Cv).await;
        put(&store, "c.txt", "three", Category::Note).await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.embedding_model, "hashing-v1-128");
        assert!(stats.by_category.contains(&(Category::Cv, 2)));
        assert!(stats.by_category.contains(&(Category::Note, 1)));
        assert!(stats.by_category.contains(&(Category::JobDescription, 0)));
    }

    fn small_chunks() -> Chunker {
        Chunker::new(ChunkingConfig {
            enabled: true,
            min_words: 20,
            chunk_size: 120,
            overlap: 0,
        })
    }

    fn long_resume() -> String {
        let mut text = String::from("# Experience\n");
        for i in 0..12 {
            text.push_str(&format!("Built data platform number {i} with spark and airflow. "));
        }
        text.push_str("\n# Hobbies\nMarine biology diving and underwater photography.\n");
        text
    }

    #[tokio::test]
    async fn test_long_document_is_stored_in_passages() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await.with_chunker(small_chunks());
        let text = long_resume();

        let record = store
            .upsert("cv.md", &text, Category::Cv, meta(&text))
            .await
            .unwrap();
        assert!(record.chunks.len() > 2);
        assert_eq!(store.get("cv.md").await.unwrap().unwrap().chunks, record.chunks);
        assert_eq!(record.chunks.last().unwrap().heading.as_deref(), Some("Hobbies"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.chunks, record.chunks.len() as u64);

        // Every passage matches, but the identity is reported once
        put(&store, "notes.txt", "Weekly notes on kafka", Category::Note).await;
        let results = store.query("marine biology diving", 10, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].identity, "cv.md");
        assert_eq!(results[0].heading.as_deref(), Some("Hobbies"));
        assert!(results[0].passage.contains("Marine biology"));
        assert_eq!(results[0].text, text);

        assert_eq!(store.delete("cv.md").await.unwrap(), 1);
        assert!(store.get("cv.md").await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().chunks, 1);
        let after = store.query("marine biology diving", 10, None).await.unwrap();
        assert!(after.iter().all(|m| m.identity != "cv.md"));
    }

    #[tokio::test]
    async fn test_shrinking_document_drops_old_passages() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await.with_chunker(small_chunks());
        let text = long_resume();

        put(&store, "cv.md", &text, Category::Cv).await;
        put(&store, "cv.md", "Short summary now", Category::Cv).await;

        let record = store.get("cv.md").await.unwrap().unwrap();
        assert_eq!(record.chunks.len(), 1);
        assert_eq!(store.stats().await.unwrap().chunks, 1);
    }

    #[tokio::test]
    async fn test_unchanged_passages_reuse_embeddings() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(CountingEmbedding {
            inner: HashingEmbedding::new(128),
            calls: AtomicUsize::new(0),
        });
        let store = SqliteIndexStore::open(&config(&dir), embedder.clone())
            .await
            .unwrap()
            .with_chunker(small_chunks());
        let text = long_resume();

        let first = store.upsert("cv.md", &text, Category::Cv, meta(&text)).await.unwrap();
        let passages = first.chunks.len();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), passages);

        // Only the edited trailing section is embedded again
        let edited = text.replace("underwater photography", "trail running");
        store.upsert("cv.md", &edited, Category::Cv, meta(&edited)).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), passages + 1);
    }

    #[tokio::test]
    async fn test_identities_under_directory() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let sep = MAIN_SEPARATOR;

        for path in [
            format!("{sep}root{sep}sub{sep}a.txt"),
            format!("{sep}root{sep}sub{sep}deep{sep}b.txt"),
            format!("{sep}root{sep}subway.txt"),
            format!("{sep}root{sep}c.txt"),
        ] {
            put(&store, &path, "text", Category::Note).await;
        }

        let under = store
            .identities_under(&format!("{sep}root{sep}sub"))
            .await
            .unwrap();
        assert_eq!(
            under,
            vec![
                format!("{sep}root{sep}sub{sep}a.txt"),
                format!("{sep}root{sep}sub{sep}deep{sep}b.txt"),
            ]
        );
        assert!(store.identities_under(&format!("{sep}elsewhere")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_cache_stats_are_reported() {
        let dir = TempDir::new().unwrap();
        assert!(open(&dir).await.embedding_cache().is_none());

        let other = TempDir::new().unwrap();
        let cached = Arc::new(CachedEmbedding::new(
            Arc::new(HashingEmbedding::new(128)),
            100,
            Duration::from_secs(60),
        ));
        let store = SqliteIndexStore::open(&config(&other), cached).await.unwrap();
        put(&store, "a.txt", "rust engineer", Category::Cv).await;
        store.query("rust engineer", 1, None).await.unwrap();

        let report = store.embedding_cache().unwrap();
        assert_eq!(report.misses, 1);
        assert_eq!(report.hits, 1);
    }
}
