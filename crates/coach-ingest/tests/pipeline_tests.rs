//! Ingestion pipeline tests against a real SQLite index

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use coach_core::{
    Category, ChangeEvent, ChangeKind, Classifier, ClassifierConfig, CoachError, FailureKind,
    PipelineConfig, Result, StoreConfig,
};
use coach_ingest::{IngestOutcome, IngestPipeline};
use coach_parser::ParserRegistry;
use coach_vector::{EmbeddingProvider, HashingEmbedding, IndexStore, SqliteIndexStore};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

// ============================================================================
// Fixtures
// ============================================================================

/// Embedding function that fails while `failures` is non-zero
struct FlakyEmbedding {
    inner: HashingEmbedding,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyEmbedding {
    fn new(failures: u32) -> Self {
        Self {
            inner: HashingEmbedding::new(64),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CoachError::EmbeddingFailure("model host timed out".to_string()));
        }
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

fn fast_retries() -> PipelineConfig {
    PipelineConfig {
        workers: 4,
        max_retries: 3,
        retry_base_ms: 1,
        ..Default::default()
    }
}

/// Embedding function that holds back "alpha" text until "beta" text is embedded
struct GatedEmbedding {
    inner: HashingEmbedding,
    released: watch::Sender<bool>,
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("alpha") {
            let mut released = self.released.subscribe();
            released
                .wait_for(|open| *open)
                .await
                .map_err(|e| CoachError::EmbeddingFailure(e.to_string()))?;
        } else if text.contains("beta") {
            self.released.send_replace(true);
        }
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    store: Arc<SqliteIndexStore>,
    pipeline: Arc<IngestPipeline>,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_embedder(Arc::new(HashingEmbedding::new(64))).await
    }

    async fn with_embedder(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self::build(embedder, fast_retries()).await
    }

    async fn build(embedder: Arc<dyn EmbeddingProvider>, config: PipelineConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        let root = root.canonicalize().unwrap();

        let store = Arc::new(
            SqliteIndexStore::open(
                &StoreConfig {
                    path: tmp.path().join("index.sqlite"),
                    collection: "career_knowledge".to_string(),
                    max_connections: 2,
                },
                embedder,
            )
            .await
            .unwrap(),
        );

        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            ParserRegistry::with_defaults(),
            Classifier::from_config(&ClassifierConfig::default()),
            config,
        ));

        Self {
            _tmp: tmp,
            root,
            store,
            pipeline,
        }
    }

    fn write(&self, relative: &str, content: impl AsRef<[u8]>) -> String {
        let path = self.root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn handle(&self, identity: &str, kind: ChangeKind) -> IngestOutcome {
        self.pipeline
            .handle(ChangeEvent::new(identity, kind))
            .await
            .unwrap()
            .outcome
    }
}

// ============================================================================
// Single events
// ============================================================================

#[tokio::test]
async fn test_created_file_is_indexed_with_directory_category() {
    let fx = Fixture::new().await;
    let id = fx.write(
        "job_posts/data_engineer.txt",
        "Data engineer role. Requirements: Rust, Kafka, SQL.",
    );

    let outcome = fx.handle(&id, ChangeKind::Created).await;
    assert_eq!(
        outcome,
        IngestOutcome::Indexed {
            category: Category::JobDescription,
            word_count: 7
        }
    );

    let record = fx.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.category, Category::JobDescription);
    assert_eq!(record.metadata.source_format, "text");
    assert!(record.text.contains("Kafka"));
}

#[tokio::test]
async fn test_empty_file_is_unknown_and_ranked_last() {
    let fx = Fixture::new().await;
    let empty = fx.write("job_posts/empty.txt", "");
    let full = fx.write("notes/rust.md", "# Rust\n\nOwnership and borrowing notes");

    fx.handle(&empty, ChangeKind::Created).await;
    fx.handle(&full, ChangeKind::Created).await;

    let record = fx.store.get(&empty).await.unwrap().unwrap();
    assert_eq!(record.category, Category::Unknown);
    assert_eq!(record.text, "");
    assert_eq!(record.metadata.word_count, 0);

    let matches = fx.store.query("ownership", 10, None).await.unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].identity, full);
    assert_eq!(matches[1].identity, empty);
}

#[tokio::test]
async fn test_same_event_twice_is_idempotent() {
    let fx = Fixture::new().await;
    let id = fx.write("skills/profile.md", "Skills: Python, Terraform, Kubernetes");

    let event = ChangeEvent::new(id.clone(), ChangeKind::Modified);
    fx.pipeline.handle(event.clone()).await.unwrap();
    let first = fx.store.get(&id).await.unwrap().unwrap();
    let report = fx.pipeline.handle(event).await.unwrap();
    assert!(matches!(report.outcome, IngestOutcome::Indexed { .. }));
    let second = fx.store.get(&id).await.unwrap().unwrap();

    assert_eq!(first.text, second.text);
    assert_eq!(first.category, second.category);
    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(first.chunks, second.chunks);
    assert_eq!(fx.store.identities().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn test_delete_removes_record() {
    let fx = Fixture::new().await;
    let id = fx.write("cv/resume.txt", "Professional experience at Acme, education BSc");
    fx.handle(&id, ChangeKind::Created).await;

    std::fs::remove_file(&id).unwrap();
    let outcome = fx.handle(&id, ChangeKind::Deleted).await;
    assert_eq!(outcome, IngestOutcome::Removed { records: 1 });

    assert!(fx.store.get(&id).await.unwrap().is_none());
    let matches = fx.store.query("professional experience", 10, None).await.unwrap();
    assert!(matches.iter().all(|m| m.identity != id));
}

#[tokio::test]
async fn test_vanished_file_is_removed() {
    let fx = Fixture::new().await;
    let id = fx.root.join("gone.txt").to_string_lossy().into_owned();

    let outcome = fx.handle(&id, ChangeKind::Modified).await;
    assert_eq!(outcome, IngestOutcome::Removed { records: 0 });
}

#[tokio::test]
async fn test_corrupt_document_keeps_previous_record() {
    let fx = Fixture::new().await;
    let id = fx.write("notes/log.txt", "Learned about tokio select loops");
    fx.handle(&id, ChangeKind::Created).await;

    fx.write("notes/log.txt", b"\x00\x01binary\x00garbage");
    let outcome = fx.handle(&id, ChangeKind::Modified).await;
    match outcome {
        IngestOutcome::Failed { failure, .. } => {
            assert_eq!(failure, FailureKind::CorruptDocument)
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let record = fx.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.text, "Learned about tokio select loops");
}

#[tokio::test]
async fn test_corrupt_pdf_is_reported() {
    let fx = Fixture::new().await;
    let id = fx.write("cv/broken.pdf", b"%PDF-1.7\nthis is not really a pdf");

    let outcome = fx.handle(&id, ChangeKind::Created).await;
    assert!(matches!(
        outcome,
        IngestOutcome::Failed {
            failure: FailureKind::CorruptDocument,
            ..
        }
    ));
    assert!(fx.store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unsupported_format_is_reported() {
    let fx = Fixture::new().await;
    let id = fx.write("job_posts/installer.exe", b"MZ\x90\x00");

    let outcome = fx.handle(&id, ChangeKind::Created).await;
    assert!(matches!(
        outcome,
        IngestOutcome::Failed {
            failure: FailureKind::UnsupportedFormat,
            attempts: 1,
            ..
        }
    ));
    assert!(fx.store.identities().await.unwrap().is_empty());
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_older_event_is_superseded() {
    let fx = Fixture::new().await;
    let id = fx.write("notes/a.txt", "first draft");
    let now = Utc::now();

    let newer = ChangeEvent::at(id.clone(), ChangeKind::Deleted, now);
    let older = ChangeEvent::at(id.clone(), ChangeKind::Modified, now - Duration::seconds(1));

    fx.pipeline.handle(newer).await.unwrap();
    let report = fx.pipeline.handle(older).await.unwrap();

    assert_eq!(report.outcome, IngestOutcome::Superseded);
    assert!(fx.store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_events_apply_newest() {
    for _ in 0..10 {
        let fx = Fixture::new().await;
        let id = fx.write("notes/a.txt", "contents that will be dropped");
        let now = Utc::now();

        let t1 = ChangeEvent::at(id.clone(), ChangeKind::Modified, now - Duration::milliseconds(5));
        let t2 = ChangeEvent::at(id.clone(), ChangeKind::Deleted, now);

        let (p1, p2) = (fx.pipeline.clone(), fx.pipeline.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { p1.handle(t1).await }),
            tokio::spawn(async move { p2.handle(t2).await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();

        assert!(fx.store.get(&id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_rename_leaves_only_new_identity() {
    let fx = Fixture::new().await;
    let a = fx.write("notes/a.txt", "Interview prep: system design");
    fx.handle(&a, ChangeKind::Created).await;

    let b = fx.root.join("notes/b.txt");
    std::fs::rename(&a, &b).unwrap();
    let b = b.to_string_lossy().into_owned();

    fx.handle(&a, ChangeKind::Deleted).await;
    fx.handle(&b, ChangeKind::Created).await;

    assert_eq!(fx.store.identities().await.unwrap(), vec![b]);
}

#[tokio::test]
async fn test_deleted_directory_removes_records_beneath() {
    let fx = Fixture::new().await;
    let a = fx.write("projects/sub/a.txt", "Project retrospective");
    let b = fx.write("projects/sub/deep/b.md", "# Notes\n\nDesign review");
    let sibling = fx.write("projects/subway.txt", "Commute reading list");
    for id in [&a, &b, &sibling] {
        fx.handle(id, ChangeKind::Created).await;
    }

    let dir = fx.root.join("projects/sub");
    std::fs::remove_dir_all(&dir).unwrap();

    let mut reports = fx.pipeline.subscribe();
    let outcome = fx
        .handle(&dir.to_string_lossy(), ChangeKind::Deleted)
        .await;
    assert_eq!(outcome, IngestOutcome::Removed { records: 2 });
    assert_eq!(fx.store.identities().await.unwrap(), vec![sibling]);

    let mut removed = Vec::new();
    while let Ok(report) = reports.try_recv() {
        if report.outcome == (IngestOutcome::Removed { records: 1 }) {
            removed.push(report.identity);
        }
    }
    assert_eq!(removed, vec![a, b]);
}

#[tokio::test]
async fn test_directory_delete_keeps_newer_records() {
    let fx = Fixture::new().await;
    let a = fx.write("projects/sub/a.txt", "Recreated after the move");
    let dir = fx.root.join("projects/sub").to_string_lossy().into_owned();
    let now = Utc::now();

    fx.pipeline
        .handle(ChangeEvent::at(a.clone(), ChangeKind::Created, now))
        .await
        .unwrap();
    let report = fx
        .pipeline
        .handle(ChangeEvent::at(dir, ChangeKind::Deleted, now - Duration::seconds(1)))
        .await
        .unwrap();

    assert_eq!(report.outcome, IngestOutcome::Removed { records: 0 });
    assert!(fx.store.get(&a).await.unwrap().is_some());
}

#[tokio::test]
async fn test_idle_identity_slots_are_pruned() {
    let config = PipelineConfig {
        slot_retention_secs: 0,
        ..fast_retries()
    };
    let fx = Fixture::build(Arc::new(HashingEmbedding::new(64)), config).await;
    let past = Utc::now() - Duration::seconds(1);

    for i in 0..70 {
        let id = fx.root.join(format!("gone-{i}.txt")).to_string_lossy().into_owned();
        fx.pipeline
            .handle(ChangeEvent::at(id, ChangeKind::Deleted, past))
            .await
            .unwrap();
    }

    assert!(fx.pipeline.tracked_identities().await < 70);
}

// ============================================================================
// Embedding failures and store outages
// ============================================================================

#[tokio::test]
async fn test_embedding_failure_is_retried() {
    let embedder = Arc::new(FlakyEmbedding::new(2));
    let fx = Fixture::with_embedder(embedder.clone()).await;
    let id = fx.write("skills/profile.txt", "Skills: Go, gRPC, Postgres");

    let outcome = fx.handle(&id, ChangeKind::Created).await;
    assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retries_remove_stale_record() {
    let embedder = Arc::new(FlakyEmbedding::new(0));
    let fx = Fixture::with_embedder(embedder.clone()).await;
    let id = fx.write("skills/profile.txt", "Skills: Go");
    fx.handle(&id, ChangeKind::Created).await;

    fx.write("skills/profile.txt", "Skills: Go, Rust, Zig");
    embedder.fail_next(u32::MAX);
    let outcome = fx.handle(&id, ChangeKind::Modified).await;

    assert_eq!(
        outcome,
        IngestOutcome::Failed {
            failure: FailureKind::EmbeddingFailure,
            message: "model host timed out".to_string(),
            attempts: 4,
        }
    );
    assert!(fx.store.get(&id).await.unwrap().is_none());

    // A later successful event restores the record
    embedder.fail_next(0);
    let outcome = fx.handle(&id, ChangeKind::Modified).await;
    assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
}

#[tokio::test]
async fn test_closed_store_is_fatal() {
    let fx = Fixture::new().await;
    let id = fx.write("notes/a.txt", "anything");
    fx.store.close().await;

    let err = fx
        .pipeline
        .handle(ChangeEvent::new(id, ChangeKind::Created))
        .await
        .unwrap_err();
    assert!(matches!(err, CoachError::StoreUnavailable(_)));
    assert!(err.is_fatal());
}

// ============================================================================
// Run loop and reconcile
// ============================================================================

#[tokio::test]
async fn test_run_processes_channel_until_closed() {
    let fx = Fixture::new().await;
    let a = fx.write("job_posts/a.txt", "Backend engineer, requirements: Rust");
    let b = fx.write("cv/b.txt", "Work experience: five years");
    let missing = fx.root.join("c.txt").to_string_lossy().into_owned();

    let mut reports = fx.pipeline.subscribe();
    let (tx, rx) = mpsc::channel(8);
    tx.send(ChangeEvent::new(a.clone(), ChangeKind::Created)).await.unwrap();
    tx.send(ChangeEvent::new(b.clone(), ChangeKind::Created)).await.unwrap();
    tx.send(ChangeEvent::new(missing, ChangeKind::Deleted)).await.unwrap();
    drop(tx);

    let summary = fx.pipeline.clone().run(rx).await.unwrap();
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.failed, 0);

    let mut seen = Vec::new();
    while let Ok(report) = reports.try_recv() {
        seen.push(report.identity);
    }
    assert_eq!(seen.len(), 3);
    assert!(seen.contains(&a) && seen.contains(&b));
}

#[tokio::test]
async fn test_run_stops_on_store_outage() {
    let fx = Fixture::new().await;
    let a = fx.write("notes/a.txt", "text");
    fx.store.close().await;

    let (tx, rx) = mpsc::channel(8);
    tx.send(ChangeEvent::new(a, ChangeKind::Created)).await.unwrap();

    // The sender stays open: the run must stop on its own
    let result = fx.pipeline.clone().run(rx).await;
    assert!(matches!(result, Err(CoachError::StoreUnavailable(_))));
    drop(tx);
}

#[tokio::test]
async fn test_reconcile_syncs_index_with_disk() {
    let fx = Fixture::new().await;
    let stale = fx.write("notes/old.txt", "Old note");
    fx.handle(&stale, ChangeKind::Created).await;
    std::fs::remove_file(&stale).unwrap();

    let kept = fx.write("notes/new.md", "# New\n\nFresh note");
    let job = fx.write("job_posts/dir/role.txt", "Platform engineer");
    fx.write("notes/.hidden.txt", "not indexed");
    fx.write("notes/photo.png", b"\x89PNG");

    let summary = fx
        .pipeline
        .reconcile(&[fx.root.clone()], true)
        .await
        .unwrap();
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.indexed, 2);

    let mut expected = vec![kept, job.clone()];
    expected.sort();
    assert_eq!(fx.store.identities().await.unwrap(), expected);

    let record = fx.store.get(&job).await.unwrap().unwrap();
    assert_eq!(record.category, Category::JobDescription);
}

#[tokio::test]
async fn test_pipeline_accepts_supported_paths() {
    let fx = Fixture::new().await;
    assert!(fx.pipeline.accepts(Path::new("cv.docx")));
    assert!(fx.pipeline.accepts(Path::new("notes.md")));
    assert!(!fx.pipeline.accepts(Path::new("photo.png")));
}

#[tokio::test]
async fn test_busy_identity_does_not_starve_other_workers() {
    let (released, _) = watch::channel(false);
    let embedder = Arc::new(GatedEmbedding {
        inner: HashingEmbedding::new(64),
        released,
    });
    let config = PipelineConfig {
        workers: 2,
        ..fast_retries()
    };
    let fx = Fixture::build(embedder, config).await;
    let alpha = fx.write("notes/alpha.txt", "alpha project notes");
    let beta = fx.write("notes/beta.txt", "beta release plan");

    let (tx, rx) = mpsc::channel(8);
    for _ in 0..3 {
        tx.send(ChangeEvent::new(alpha.clone(), ChangeKind::Modified))
            .await
            .unwrap();
    }
    tx.send(ChangeEvent::new(beta.clone(), ChangeKind::Created))
        .await
        .unwrap();
    drop(tx);

    // Queued alpha events wait on their identity, not on a worker
    let summary = timeout(std::time::Duration::from_secs(10), fx.pipeline.clone().run(rx))
        .await
        .expect("run stalled behind one identity")
        .unwrap();
    assert_eq!(summary.indexed, 4);
    assert!(fx.store.get(&beta).await.unwrap().is_some());
}
