//! Ingestion pipeline
//!
//! Turns change events into index mutations: parse, classify and upsert
//! for created/modified files, delete for removed ones (a removed directory
//! takes every record beneath it along). Work for distinct identities runs
//! in parallel on a bounded worker pool; work for one identity is
//! serialized and applied in event order.
//!
//! Author: hephaex@gmail.com

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use coach_core::{
    Category, ChangeEvent, ChangeKind, Classifier, CoachError, DocumentMetadata, EventOrder,
    FailureKind, PipelineConfig, Result,
};
use coach_parser::{ParsedDocument, ParserError, ParserRegistry};
use coach_vector::IndexStore;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore, SemaphorePermit};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::scan::discover_files;

// ============================================================================
// Reports
// ============================================================================

/// Result of handling one change event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The record was written
    Indexed { category: Category, word_count: u64 },

    /// Records for the identity were removed (zero when none existed)
    Removed { records: u64 },

    /// A newer event for the identity was already applied
    Superseded,

    /// The event could not be applied; the index keeps its previous state
    /// except after exhausted embedding retries, which remove the stale record
    Failed {
        failure: FailureKind,
        message: String,
        attempts: u32,
    },
}

/// Per-event report broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub identity: String,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

impl IngestReport {
    fn new(event: &ChangeEvent, outcome: IngestOutcome) -> Self {
        Self {
            identity: event.identity.clone(),
            kind: event.kind,
            timestamp: event.timestamp,
            outcome,
        }
    }

    /// Failure class, when the event failed
    pub fn failure(&self) -> Option<FailureKind> {
        match &self.outcome {
            IngestOutcome::Failed { failure, .. } => Some(*failure),
            _ => None,
        }
    }
}

/// Totals over a pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub indexed: u64,
    pub removed: u64,
    pub superseded: u64,
    pub failed: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Indexed { .. } => self.indexed += 1,
            IngestOutcome::Removed { .. } => self.removed += 1,
            IngestOutcome::Superseded => self.superseded += 1,
            IngestOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Add another run's totals to this one
    pub fn merge(&mut self, other: RunSummary) {
        self.indexed += other.indexed;
        self.removed += other.removed;
        self.superseded += other.superseded;
        self.failed += other.failed;
    }

    /// Number of events handled
    pub fn total(&self) -> u64 {
        self.indexed + self.removed + self.superseded + self.failed
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} indexed, {} removed, {} superseded, {} failed",
            self.indexed, self.removed, self.superseded, self.failed
        )
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Default)]
struct IdentitySlot {
    last_applied: Option<EventOrder>,
}

/// Slot table size below which no pruning happens
const MIN_PRUNE_AT: usize = 64;

/// Per-identity slots. Idle slots whose last event is older than the
/// retention horizon are dropped whenever the table doubles in size.
#[derive(Debug)]
struct SlotTable {
    entries: HashMap<String, Arc<Mutex<IdentitySlot>>>,
    prune_at: usize,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            prune_at: MIN_PRUNE_AT,
        }
    }
}

/// Ingestion pipeline over one index store
pub struct IngestPipeline {
    store: Arc<dyn IndexStore>,
    parser: Arc<ParserRegistry>,
    classifier: Classifier,
    config: PipelineConfig,
    /// Per-identity lock; tokio mutexes queue waiters in FIFO order
    slots: Mutex<SlotTable>,
    reports: broadcast::Sender<IngestReport>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn IndexStore>,
        parser: ParserRegistry,
        classifier: Classifier,
        config: PipelineConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(256);
        Self {
            store,
            parser: Arc::new(parser),
            classifier,
            config,
            slots: Mutex::new(SlotTable::default()),
            reports,
        }
    }

    /// Subscribe to per-event reports
    pub fn subscribe(&self) -> broadcast::Receiver<IngestReport> {
        self.reports.subscribe()
    }

    /// The index store this pipeline writes to
    pub fn store(&self) -> Arc<dyn IndexStore> {
        Arc::clone(&self.store)
    }

    /// Whether the pipeline would attempt to parse the path
    pub fn accepts(&self, path: &Path) -> bool {
        self.parser.supports_path(path)
    }

    /// Number of identities whose ordering state is currently tracked
    pub async fn tracked_identities(&self) -> usize {
        self.slots.lock().await.entries.len()
    }

    async fn slot(&self, identity: &str) -> Arc<Mutex<IdentitySlot>> {
        let mut slots = self.slots.lock().await;
        if slots.entries.len() >= slots.prune_at {
            self.prune_slots(&mut slots);
        }
        Arc::clone(slots.entries.entry(identity.to_string()).or_default())
    }

    /// Forget idle identities whose last event is past the retention horizon
    ///
    /// A slot that is referenced elsewhere or locked is in use and kept.
    fn prune_slots(&self, slots: &mut SlotTable) {
        let retention = self.config.slot_retention_secs.min(u64::from(u32::MAX)) as i64;
        let horizon = Utc::now() - chrono::Duration::seconds(retention);
        let before = slots.entries.len();

        slots.entries.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(state) => state.last_applied.is_some_and(|last| last.timestamp >= horizon),
                Err(_) => true,
            }
        });

        slots.prune_at = (slots.entries.len() * 2).max(MIN_PRUNE_AT);
        debug!(before, after = slots.entries.len(), "Pruned idle identity slots");
    }

    /// Apply one change event to the index
    ///
    /// Per-identity failures are reported in the returned report. Only
    /// errors that make the store unusable are returned as `Err`.
    pub async fn handle(&self, event: ChangeEvent) -> Result<IngestReport> {
        self.handle_gated(event, None).await
    }

    /// Apply one event, holding a worker permit from `gate` only while the
    /// index is being changed
    ///
    /// The identity lock is taken first, so events queued behind a busy
    /// identity never occupy a worker.
    async fn handle_gated(&self, event: ChangeEvent, gate: Option<&Semaphore>) -> Result<IngestReport> {
        let slot = self.slot(&event.identity).await;
        let mut slot = slot.lock().await;

        if slot.last_applied.is_some_and(|last| event.order() < last) {
            debug!(identity = %event.identity, kind = %event.kind, "Skipping superseded event");
            return Ok(self.publish(IngestReport::new(&event, IngestOutcome::Superseded)));
        }

        let outcome = match event.kind {
            ChangeKind::Deleted => self.remove_tree(&event, gate).await,
            ChangeKind::Created | ChangeKind::Modified => {
                let _permit = acquire(gate).await?;
                self.index(&event.identity).await
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(identity = %event.identity, kind = %event.kind, "Ingestion stopped: {e}");
                if let Some(failure) = e.failure_kind() {
                    self.publish(IngestReport::new(
                        &event,
                        IngestOutcome::Failed {
                            failure,
                            message: e.to_string(),
                            attempts: 1,
                        },
                    ));
                }
                return Err(e);
            }
        };

        slot.last_applied = Some(event.order());
        Ok(self.publish(IngestReport::new(&event, outcome)))
    }

    fn publish(&self, report: IngestReport) -> IngestReport {
        match &report.outcome {
            IngestOutcome::Indexed { category, word_count } => info!(
                identity = %report.identity,
                category = %category,
                words = word_count,
                "Indexed document"
            ),
            IngestOutcome::Removed { records } => {
                info!(identity = %report.identity, records, "Removed document")
            }
            IngestOutcome::Superseded => {}
            IngestOutcome::Failed {
                failure, message, ..
            } => warn!(identity = %report.identity, failure = %failure, "{message}"),
        }

        // No subscribers is fine
        let _ = self.reports.send(report.clone());
        report
    }

    async fn remove(&self, identity: &str) -> Result<IngestOutcome> {
        let records = self.store.delete(identity).await?;
        Ok(IngestOutcome::Removed { records })
    }

    /// Remove the identity and, when it named a directory, every record beneath it
    ///
    /// Each record beneath is removed under its own identity lock and
    /// reported on its own. A record written by an event newer than the
    /// removal is kept.
    async fn remove_tree(&self, event: &ChangeEvent, gate: Option<&Semaphore>) -> Result<IngestOutcome> {
        let mut records = {
            let _permit = acquire(gate).await?;
            self.store.delete(&event.identity).await?
        };

        for child in self.store.identities_under(&event.identity).await? {
            let slot = self.slot(&child).await;
            let mut slot = slot.lock().await;
            if slot.last_applied.is_some_and(|last| event.order() < last) {
                debug!(identity = %child, "Keeping record written after its directory was removed");
                continue;
            }

            let removed = {
                let _permit = acquire(gate).await?;
                self.store.delete(&child).await?
            };
            slot.last_applied = Some(event.order());
            records += removed;
            self.publish(IngestReport {
                identity: child,
                kind: ChangeKind::Deleted,
                timestamp: event.timestamp,
                outcome: IngestOutcome::Removed { records: removed },
            });
        }

        Ok(IngestOutcome::Removed { records })
    }

    async fn index(&self, identity: &str) -> Result<IngestOutcome> {
        let path = PathBuf::from(identity);
        let parser = Arc::clone(&self.parser);
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&path))
            .await
            .map_err(|e| CoachError::Other(anyhow::anyhow!("parse task failed: {e}")))?;

        let doc = match parsed {
            Ok(doc) => doc,
            // The file vanished after the event was emitted
            Err(e) if e.is_not_found() => return self.remove(identity).await,
            Err(e) => {
                return Ok(IngestOutcome::Failed {
                    failure: parse_failure(&e),
                    message: e.to_string(),
                    attempts: 1,
                })
            }
        };

        let category = self.classifier.classify(Path::new(identity), &doc.content);
        let metadata = document_metadata(&doc);
        let word_count = metadata.word_count;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .store
                .upsert(identity, &doc.content, category, metadata.clone())
                .await
            {
                Ok(_) => return Ok(IngestOutcome::Indexed { category, word_count }),
                Err(CoachError::EmbeddingFailure(message)) => {
                    if attempt > self.config.max_retries {
                        // Leave no stale vector behind for content that changed
                        self.store.delete(identity).await?;
                        return Ok(IngestOutcome::Failed {
                            failure: FailureKind::EmbeddingFailure,
                            message,
                            attempts: attempt,
                        });
                    }

                    let delay = self.backoff(attempt);
                    warn!(
                        identity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Embedding failed, retrying: {message}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.config.retry_base_ms.saturating_mul(factor))
    }

    /// Consume change events until the channel closes
    ///
    /// At most `workers` events change the index at once. Each task waits
    /// for its identity's lock before taking a worker permit, so a burst of
    /// events for one identity never starves the others. The first fatal
    /// error stops dispatching; tasks already running are allowed to finish
    /// and the error is returned.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>) -> Result<RunSummary> {
        let workers = self.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<Result<IngestReport>> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut fatal: Option<CoachError> = None;

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = collect(&mut summary, joined) {
                        fatal = Some(e);
                        break;
                    }
                }
                // Bounded backlog keeps backpressure on the event channel
                event = events.recv(), if tasks.len() < workers * 4 => {
                    let Some(event) = event else { break };
                    let pipeline = Arc::clone(&self);
                    let gate = Arc::clone(&semaphore);
                    tasks.spawn(async move { pipeline.handle_gated(event, Some(&gate)).await });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = collect(&mut summary, joined) {
                fatal.get_or_insert(e);
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => {
                debug!(%summary, "Pipeline run finished");
                Ok(summary)
            }
        }
    }

    /// Bring the index in line with the files currently under `roots`
    ///
    /// Removes records whose files no longer exist, then indexes every
    /// supported file. Unchanged files reuse their stored embeddings.
    pub async fn reconcile(self: &Arc<Self>, roots: &[PathBuf], recursive: bool) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for identity in self.store.identities().await? {
            if !Path::new(&identity).exists() {
                let report = self
                    .handle(ChangeEvent::new(identity, ChangeKind::Deleted))
                    .await?;
                summary.record(&report.outcome);
            }
        }

        let parser = Arc::clone(&self.parser);
        let owned_roots = roots.to_vec();
        let files = tokio::task::spawn_blocking(move || {
            discover_files(&owned_roots, recursive, |path| parser.supports_path(path))
        })
        .await
        .map_err(|e| CoachError::Other(anyhow::anyhow!("scan task failed: {e}")))?;
        info!(files = files.len(), "Reconciling index with watched folders");

        let (tx, rx) = mpsc::channel(files.len().max(1));
        for path in files {
            if tx
                .send(ChangeEvent::for_path(&path, ChangeKind::Created))
                .await
                .is_err()
            {
                break;
            }
        }
        drop(tx);

        summary.merge(Arc::clone(self).run(rx).await?);
        info!(%summary, "Reconcile finished");
        Ok(summary)
    }
}

async fn acquire(gate: Option<&Semaphore>) -> Result<Option<SemaphorePermit<'_>>> {
    match gate {
        Some(gate) => gate
            .acquire()
            .await
            .map(Some)
            .map_err(|e| CoachError::Other(anyhow::anyhow!("worker pool closed: {e}"))),
        None => Ok(None),
    }
}

fn collect(
    summary: &mut RunSummary,
    joined: std::result::Result<Result<IngestReport>, JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(report)) => {
            summary.record(&report.outcome);
            Ok(())
        }
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => {
            summary.failed += 1;
            error!("Ingestion task failed: {e}");
            Ok(())
        }
        Err(e) => {
            summary.failed += 1;
            error!("Ingestion task panicked: {e}");
            Ok(())
        }
    }
}

fn parse_failure(err: &ParserError) -> FailureKind {
    if err.is_unsupported() {
        FailureKind::UnsupportedFormat
    } else {
        FailureKind::CorruptDocument
    }
}

fn document_metadata(doc: &ParsedDocument) -> DocumentMetadata {
    let meta = &doc.metadata;
    let mut metadata =
        DocumentMetadata::new(doc.format.as_str(), meta.word_count).with_byte_size(meta.byte_size);

    if let Some(modified) = meta.modified {
        metadata = metadata.with_modified_at(system_time_to_utc(modified));
    }
    if let Some(pages) = meta.page_count {
        metadata = metadata.with_page_count(pages);
    }
    if let Some(title) = &meta.title {
        metadata = metadata.with_title(title.clone());
    }
    metadata
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
