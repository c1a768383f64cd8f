//! File system watcher producing debounced change events.
//!
//! Raw notifications from `notify` are translated into per-identity
//! changes, merged while the identity is still being written, and emitted
//! on a bounded channel once the identity has been quiet for the debounce
//! window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coach_core::{identity_for, ChangeEvent, ChangeKind, CoachError, Result, WatchConfig};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::scan::discover_files;

// ============================================================================
// Event translation
// ============================================================================

/// Whether a path names a hidden or editor temporary file
pub fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return true;
    };

    name.starts_with('.')
        || name.starts_with("~$")
        || name.ends_with('~')
        || name.ends_with(".swp")
        || name.ends_with(".tmp")
}

/// Translate one raw notification into path-level changes, in order.
///
/// A rename becomes a deletion of the old path followed by a creation of
/// the new one. A directory that appears (created or renamed in) expands
/// to a creation of every file beneath it when watching recursively. A
/// directory that disappears is reported as a deletion of the directory
/// path itself; the pipeline removes everything indexed under it.
/// Metadata and access notifications carry no content change and are
/// dropped.
pub fn translate(event: &Event, recursive: bool) -> Vec<(PathBuf, ChangeKind)> {
    let expand = |paths: &[PathBuf]| -> Vec<(PathBuf, ChangeKind)> {
        paths.iter().flat_map(|p| appeared(p, recursive)).collect()
    };

    match &event.kind {
        // A folder that is already gone again has nothing to index
        EventKind::Create(CreateKind::Folder) => event
            .paths
            .iter()
            .filter(|p| p.is_dir())
            .flat_map(|p| appeared(p, recursive))
            .collect(),
        EventKind::Create(_) => expand(&event.paths),
        EventKind::Remove(_) => tag(&event.paths, ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => tag(&event.paths[..event.paths.len().min(1)], ChangeKind::Deleted),
            RenameMode::To => expand(&event.paths[..event.paths.len().min(1)]),
            RenameMode::Both if event.paths.len() >= 2 => {
                let mut changes = vec![(event.paths[0].clone(), ChangeKind::Deleted)];
                changes.extend(appeared(&event.paths[1], recursive));
                changes
            }
            // Backends that cannot tell which side of the rename this is
            _ => event
                .paths
                .iter()
                .flat_map(|p| {
                    if p.exists() {
                        appeared(p, recursive)
                    } else {
                        vec![(p.clone(), ChangeKind::Deleted)]
                    }
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| (p.clone(), ChangeKind::Modified))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// A path that came into view: the file itself, or the files under a directory
fn appeared(path: &Path, recursive: bool) -> Vec<(PathBuf, ChangeKind)> {
    if !path.is_dir() {
        return vec![(path.to_path_buf(), ChangeKind::Created)];
    }
    if !recursive {
        return Vec::new();
    }

    let files = discover_files(&[path.to_path_buf()], true, |_| true);
    debug!(dir = %path.display(), files = files.len(), "Directory appeared");
    files
        .into_iter()
        .map(|file| (file, ChangeKind::Created))
        .collect()
}

fn tag(paths: &[PathBuf], kind: ChangeKind) -> Vec<(PathBuf, ChangeKind)> {
    paths.iter().map(|p| (p.clone(), kind)).collect()
}

/// Combine a pending change with a newer one for the same identity
pub fn merge_kinds(pending: ChangeKind, next: ChangeKind) -> ChangeKind {
    match (pending, next) {
        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
        (ChangeKind::Deleted, _) => ChangeKind::Modified,
        (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
        (_, next) => next,
    }
}

// ============================================================================
// Debouncer
// ============================================================================

#[derive(Debug, Clone)]
struct Pending {
    kind: ChangeKind,
    timestamp: DateTime<Utc>,
    deadline: Instant,
    /// Position of the latest notification, used for flush order
    slot: u64,
}

/// Per-identity debounce and deduplication buffer
///
/// At most one change is pending per identity. Each new notification merges
/// into it and pushes its deadline out by the window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Pending>,
    next_slot: u64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_slot: 0,
        }
    }

    /// Record a notification observed at `now`
    pub fn push(&mut self, identity: String, kind: ChangeKind, timestamp: DateTime<Utc>, now: Instant) {
        let slot = self.next_slot;
        self.next_slot += 1;
        let deadline = now + self.window;

        self.pending
            .entry(identity)
            .and_modify(|p| {
                p.kind = merge_kinds(p.kind, kind);
                p.timestamp = p.timestamp.max(timestamp);
                p.deadline = deadline;
                p.slot = slot;
            })
            .or_insert(Pending {
                kind,
                timestamp,
                deadline,
                slot,
            });
    }

    /// Earliest deadline among pending changes
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every change whose identity has been quiet long enough
    pub fn drain_ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let mut ready: Vec<(String, Pending)> = Vec::new();
        self.pending.retain(|identity, pending| {
            if pending.deadline <= now {
                ready.push((identity.clone(), pending.clone()));
                false
            } else {
                true
            }
        });

        ready.sort_by_key(|(_, p)| p.slot);
        ready
            .into_iter()
            .map(|(identity, p)| ChangeEvent::at(identity, p.kind, p.timestamp))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Watch session
// ============================================================================

/// Lifecycle of a watch session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching,
    Stopped,
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Watching => write!(f, "watching"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// An explicitly started and stopped watch over a set of folders
pub struct WatchSession {
    config: WatchConfig,
    state: WatchState,
    roots: Vec<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchSession {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            state: WatchState::Idle,
            roots: Vec::new(),
            watcher: None,
            shutdown: None,
            task: None,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Canonical roots being watched (empty until started)
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Begin watching the configured roots
    ///
    /// Must be called inside a tokio runtime. Returns the receiving end of
    /// the change event channel.
    pub fn start(&mut self) -> Result<mpsc::Receiver<ChangeEvent>> {
        if self.state != WatchState::Idle {
            return Err(CoachError::WatchError(format!(
                "cannot start a session that is {}",
                self.state
            )));
        }
        if self.config.roots.is_empty() {
            return Err(CoachError::WatchError("no folders to watch".to_string()));
        }

        let roots = self
            .config
            .roots
            .iter()
            .map(|root| {
                std::fs::canonicalize(root).map_err(|e| {
                    CoachError::WatchError(format!("cannot watch {}: {e}", root.display()))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| CoachError::WatchError(format!("watcher setup failed: {e}")))?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for root in &roots {
            watcher
                .watch(root, mode)
                .map_err(|e| CoachError::WatchError(format!("cannot watch {}: {e}", root.display())))?;
            info!(root = %root.display(), "Watching folder");
        }

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let window = Duration::from_millis(self.config.debounce_ms);

        self.task = Some(tokio::spawn(debounce_loop(
            raw_rx,
            event_tx,
            shutdown_rx,
            window,
            self.config.recursive,
        )));
        self.watcher = Some(watcher);
        self.shutdown = Some(shutdown_tx);
        self.roots = roots;
        self.state = WatchState::Watching;

        Ok(event_rx)
    }

    /// Release all OS watches and stop emitting. Pending changes are dropped.
    pub async fn stop(&mut self) {
        if self.state == WatchState::Stopped {
            return;
        }
        self.state = WatchState::Stopped;

        // Dropping the watcher releases the OS watches
        self.watcher.take();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Watch task ended abnormally: {e}");
            }
        }
        info!("Watch session stopped");
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    event_tx: mpsc::Sender<ChangeEvent>,
    mut shutdown: oneshot::Receiver<()>,
    window: Duration,
    recursive: bool,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.next_deadline();
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    let now = Instant::now();
                    let timestamp = Utc::now();
                    for (path, kind) in translate(&event, recursive) {
                        if is_ignored(&path) {
                            continue;
                        }
                        debouncer.push(identity_for(&path), kind, timestamp, now);
                    }
                }
                Some(Err(e)) => warn!("Watch error: {e}"),
                None => break,
            },
            _ = sleep_until(deadline) => {
                for event in debouncer.drain_ready(Instant::now()) {
                    debug!(identity = %event.identity, kind = %event.kind, "Change detected");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => return,
                        sent = event_tx.send(event) => {
                            if sent.is_err() {
                                // Receiver dropped; nobody is listening
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    if !debouncer.is_empty() {
        debug!(discarded = debouncer.len(), "Discarding pending changes on stop");
    }
}
