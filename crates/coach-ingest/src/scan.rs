//! Discovery of existing files under the watched roots

use std::path::{Path, PathBuf};

use crate::watcher::is_ignored;

/// Recursively collect files under `roots` accepted by `accept`.
///
/// Hidden directories and ignored files are skipped. Each path is the
/// canonical directory joined with the entry's own name, so it matches the
/// identity the watcher reports for that entry; a symlinked file keeps its
/// link name. Unreadable entries are skipped rather than aborting the scan.
pub fn discover_files<F>(roots: &[PathBuf], recursive: bool, accept: F) -> Vec<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let mut results = Vec::new();
    for root in roots {
        match root.canonicalize() {
            Ok(root) => walk_dir(&root, recursive, &accept, &mut results),
            Err(e) => tracing::warn!(root = %root.display(), "Skipping unreadable root: {e}"),
        }
    }
    results.sort();
    results.dedup();
    results
}

fn walk_dir<F>(current: &Path, recursive: bool, accept: &F, results: &mut Vec<PathBuf>)
where
    F: Fn(&Path) -> bool,
{
    let Ok(entries) = std::fs::read_dir(current) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if recursive && !hidden {
                walk_dir(&path, recursive, accept, results);
            }
        } else if !is_ignored(&path) && accept(&path) && path.is_file() {
            // `is_file` follows links, so broken links and links to directories drop out
            results.push(path);
        }
    }
}
