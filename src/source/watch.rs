//! Event-driven backend built on `notify`.
//!
//! The parent directory of each followed file is watched, so rotation
//! (rename + create) is seen as well as appends. Events cross from the
//! watcher thread into the worker through a tokio channel. A fallback
//! timer rescans in case an event was missed and retries pending paths.

use super::SeekPolicy;
use super::files::FileTable;
use crate::error::SourceError;
use crate::filter::Filter;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Rescan interval when no event arrives.
pub const DEFAULT_FALLBACK: Duration = Duration::from_secs(5);

pub struct WatchSource {
    pub(crate) files: FileTable,
    watcher: RecommendedWatcher,
    events: mpsc::Receiver<Result<Event, notify::Error>>,
    watched_dirs: HashSet<PathBuf>,
    /// Followed path as configured, to the absolute path events carry.
    event_paths: HashMap<PathBuf, PathBuf>,
    fallback: Duration,
    primed: bool,
}

impl std::fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSource")
            .field("files", &self.files)
            .field("watched_dirs", &self.watched_dirs)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl WatchSource {
    pub fn new(fallback: Duration) -> Result<Self, SourceError> {
        let (tx, events) = mpsc::channel::<Result<Event, notify::Error>>(100);
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )?;
        Ok(Self {
            files: FileTable::default(),
            watcher,
            events,
            watched_dirs: HashSet::new(),
            event_paths: HashMap::new(),
            fallback,
            primed: false,
        })
    }

    pub fn add_path(&mut self, path: &Path, seek: SeekPolicy, filter: &mut Filter) -> Result<bool, SourceError> {
        let added = self.files.add_path(path, seek, filter)?;
        if added {
            if let Some((dir, event_path)) = watch_target(path) {
                if !self.watched_dirs.contains(&dir) {
                    self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
                    debug!(jail = %filter.jail(), dir = %dir.display(), "Watching directory");
                    self.watched_dirs.insert(dir);
                }
                self.event_paths.insert(path.to_path_buf(), event_path);
            }
        }
        Ok(added)
    }

    /// Stop following `path`; its directory is unwatched once no other
    /// followed file lives there.
    pub fn del_path(&mut self, path: &Path) -> bool {
        if !self.files.del_path(path) {
            return false;
        }
        let Some(event_path) = self.event_paths.remove(path) else {
            return true;
        };
        if let Some(dir) = event_path.parent() {
            let still_used = self.event_paths.values().any(|p| p.parent() == Some(dir));
            if !still_used && self.watched_dirs.remove(dir) {
                if let Err(e) = self.watcher.unwatch(dir) {
                    debug!(dir = %dir.display(), error = %e, "Failed to unwatch directory");
                }
            }
        }
        true
    }

    /// Block until a followed file (or its directory entry) changes, or
    /// the fallback timer fires. The first call returns at once.
    pub async fn wait(&mut self) {
        if !self.primed {
            self.primed = true;
            return;
        }
        let deadline = tokio::time::sleep(self.fallback);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(res) = self.events.recv() => match res {
                    Ok(event) if self.is_relevant(&event) => return,
                    Ok(_) => {}
                    Err(e) => error!("File watcher error: {}", e),
                },
                _ = &mut deadline => return,
            }
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        if matches!(event.kind, EventKind::Access(_)) {
            return false;
        }
        event
            .paths
            .iter()
            .any(|p| self.event_paths.values().any(|f| f == p))
    }

    pub async fn process(&mut self, filter: &mut Filter, stop: &CancellationToken) -> usize {
        self.files.retry_pending(filter);
        self.files.read(filter, stop).await
    }
}

fn parent_dir(path: &Path) -> Option<PathBuf> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| Some(PathBuf::from(".")))
}

/// Directory to watch for `path` and the path its events will name. The
/// directory is resolved since the watcher reports absolute paths; the
/// file itself is not, so a symlinked log is still matched by its name.
fn watch_target(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let name = path.file_name()?;
    let dir = parent_dir(path)?;
    let dir = dir.canonicalize().or_else(|_| std::path::absolute(&dir)).ok()?;
    let event_path = dir.join(name);
    Some((dir, event_path))
}
