//! Coach Ingest - Folder watching and the ingestion pipeline
//!
//! - `watcher`: debounced, deduplicated change events from watched folders
//! - `pipeline`: parse, classify and index each change, in order per file
//! - `session`: a running watch feeding the pipeline until shutdown

pub mod pipeline;
pub mod scan;
pub mod session;
pub mod watcher;

pub use pipeline::{IngestOutcome, IngestPipeline, IngestReport, RunSummary};
pub use scan::discover_files;
pub use session::IngestSession;
pub use watcher::{is_ignored, merge_kinds, translate, Debouncer, WatchSession, WatchState};
