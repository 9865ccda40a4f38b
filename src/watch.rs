//! Repository watcher that invalidates the full-text index on change.
//!
//! The watcher never reindexes. It flags the repository dirty so the next
//! indexing pass rebuilds, and lets the daemon re-decide its serving mode.

use std::{
   path::{Component, Path, PathBuf},
   time::Duration,
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};

use crate::Result;

const IGNORED_DIRS: &[&str] = &[".git", ".kiri", "node_modules", "target"];

/// Keeps the debounced watcher alive; dropping it stops watching.
pub struct RepoWatcher {
   _debouncer: Debouncer<RecommendedWatcher>,
}

/// Whether a change at `path` can affect indexed content.
pub fn is_relevant(path: &Path, root: &Path, db_dir: Option<&Path>) -> bool {
   if db_dir.is_some_and(|dir| path.starts_with(dir)) {
      return false;
   }
   let relative = path.strip_prefix(root).unwrap_or(path);
   !relative.components().any(|c| match c {
      Component::Normal(name) => name
         .to_str()
         .is_some_and(|name| IGNORED_DIRS.contains(&name)),
      _ => false,
   })
}

/// Watches `root` recursively and calls `on_change` with each debounced
/// batch of relevant paths.
pub fn watch_repo<F>(
   root: &Path,
   db_dir: Option<PathBuf>,
   debounce: Duration,
   on_change: F,
) -> Result<RepoWatcher>
where
   F: Fn(Vec<PathBuf>) + Send + 'static,
{
   let filter_root = root.to_path_buf();
   let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| match res {
      Ok(events) => {
         let paths: Vec<PathBuf> = events
            .into_iter()
            .map(|e| e.path)
            .filter(|p| is_relevant(p, &filter_root, db_dir.as_deref()))
            .collect();
         if !paths.is_empty() {
            on_change(paths);
         }
      },
      Err(e) => tracing::warn!("watch error: {e}"),
   })?;

   debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
   tracing::info!("watching {} for changes", root.display());
   Ok(RepoWatcher { _debouncer: debouncer })
}
