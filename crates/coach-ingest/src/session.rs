//! Running ingestion session: a watch session feeding the pipeline

use std::future::Future;
use std::sync::Arc;

use coach_core::{CoachError, Result, WatchConfig};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::{IngestPipeline, RunSummary};
use crate::watcher::WatchSession;

/// Watches the configured folders and ingests every change until stopped
pub struct IngestSession {
    watch: WatchSession,
    pipeline: Arc<IngestPipeline>,
    run: JoinHandle<Result<RunSummary>>,
    reconciled: RunSummary,
}

impl IngestSession {
    /// Start watching, reconcile existing files, then process changes
    ///
    /// Watching starts before the initial scan so changes made during the
    /// scan are not missed.
    pub async fn start(config: &WatchConfig, pipeline: Arc<IngestPipeline>) -> Result<Self> {
        let mut watch = WatchSession::new(config.clone());
        let events = watch.start()?;

        let reconciled = if config.initial_scan {
            match pipeline.reconcile(watch.roots(), config.recursive).await {
                Ok(summary) => summary,
                Err(e) => {
                    watch.stop().await;
                    return Err(e);
                }
            }
        } else {
            RunSummary::default()
        };

        let run = tokio::spawn(Arc::clone(&pipeline).run(events));
        info!(roots = watch.roots().len(), "Ingestion session started");

        Ok(Self {
            watch,
            pipeline,
            run,
            reconciled,
        })
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    pub fn watch(&self) -> &WatchSession {
        &self.watch
    }

    /// Summary of the initial scan
    pub fn reconciled(&self) -> RunSummary {
        self.reconciled
    }

    /// Run until `shutdown` resolves or the pipeline stops on a fatal error
    ///
    /// Either way the watch session is stopped. Events already dispatched
    /// are processed before this returns.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let finished = tokio::select! {
            _ = shutdown => None,
            joined = &mut self.run => Some(joined),
        };

        self.watch.stop().await;

        // Stopping the watch closes the event channel, which ends the run
        let joined = match finished {
            Some(joined) => joined,
            None => (&mut self.run).await,
        };

        if let Some(cache) = self.pipeline.store().embedding_cache() {
            info!(
                hits = cache.hits,
                misses = cache.misses,
                entries = cache.entries,
                hit_rate = cache.hit_rate,
                "Embedding cache"
            );
        }

        let mut summary = joined
            .map_err(|e| CoachError::Other(anyhow::anyhow!("pipeline task failed: {e}")))?
            .inspect_err(|e| error!("Ingestion pipeline stopped: {e}"))?;
        summary.merge(self.reconciled);
        Ok(summary)
    }
}
