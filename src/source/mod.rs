//! Log sources feeding a filter.
//!
//! - [`PollSource`] stats followed files every sleep interval
//! - [`WatchSource`] waits for `notify` events on their directories
//! - [`JournalSource`] follows the systemd journal through `journalctl`
//!
//! All three are driven by [`LogSource::run`], which alternates a
//! cancellable wait with an uncancelled processing step so a stop request
//! never cuts a line in half.

pub mod container;
mod files;
pub mod journal;
pub mod poll;
pub mod watch;

pub use container::{FileContainer, decode_line};
pub use journal::{JournalMatch, JournalSource};
pub use poll::PollSource;
pub use watch::WatchSource;

use crate::error::SourceError;
use crate::filter::Filter;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where reading starts in a newly added file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekPolicy {
    Head,
    Tail,
    /// First line dated at or after this Unix time.
    Time(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Polling,
    Watch,
    Journal,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Polling => "polling",
            Self::Watch => "watch",
            Self::Journal => "journal",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "polling" => Ok(Self::Polling),
            "watch" | "inotify" | "pyinotify" => Ok(Self::Watch),
            "journal" | "systemd" => Ok(Self::Journal),
            _ => Err(SourceError::UnknownBackend(s.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum LogSource {
    Poll(PollSource),
    Watch(WatchSource),
    Journal(JournalSource),
}

impl LogSource {
    /// Create a source of the given kind. `Auto` tries the watch backend
    /// and falls back to polling when no watcher can be started.
    /// `sleep_time` is the polling interval, or the watch fallback rescan.
    pub fn new(kind: BackendKind, sleep_time: Duration) -> Result<Self, SourceError> {
        match kind {
            BackendKind::Polling => Ok(Self::Poll(PollSource::new(sleep_time))),
            BackendKind::Watch => Ok(Self::Watch(WatchSource::new(sleep_time.max(watch::DEFAULT_FALLBACK))?)),
            BackendKind::Journal => Ok(Self::Journal(JournalSource::new(None))),
            BackendKind::Auto => match WatchSource::new(sleep_time.max(watch::DEFAULT_FALLBACK)) {
                Ok(w) => Ok(Self::Watch(w)),
                Err(e) => {
                    warn!(error = %e, "File watcher unavailable, falling back to polling");
                    Ok(Self::Poll(PollSource::new(sleep_time)))
                }
            },
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Poll(_) => BackendKind::Polling,
            Self::Watch(_) => BackendKind::Watch,
            Self::Journal(_) => BackendKind::Journal,
        }
    }

    pub fn journal_mut(&mut self) -> Option<&mut JournalSource> {
        match self {
            Self::Journal(j) => Some(j),
            _ => None,
        }
    }

    /// Follow `path`. Returns `false` if it was already followed.
    /// A missing path is `SourceError::Unavailable`.
    pub fn add_path(&mut self, path: &Path, seek: SeekPolicy, filter: &mut Filter) -> Result<bool, SourceError> {
        match self {
            Self::Poll(p) => p.files.add_path(path, seek, filter),
            Self::Watch(w) => w.add_path(path, seek, filter),
            Self::Journal(j) => j.add_path(path, seek),
        }
    }

    pub fn del_path(&mut self, path: &Path) -> bool {
        match self {
            Self::Poll(p) => p.files.del_path(path),
            Self::Watch(w) => w.del_path(path),
            Self::Journal(j) => j.del_path(path),
        }
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        match self {
            Self::Poll(p) => p.files.contains_path(path),
            Self::Watch(w) => w.files.contains_path(path),
            Self::Journal(j) => j.contains_path(path),
        }
    }

    pub fn log_paths(&self) -> Vec<PathBuf> {
        match self {
            Self::Poll(p) => p.files.log_paths(),
            Self::Watch(w) => w.files.log_paths(),
            Self::Journal(j) => j.log_paths(),
        }
    }

    /// Paths that went missing and are retried on later cycles.
    pub fn pending_paths(&self) -> Vec<PathBuf> {
        match self {
            Self::Poll(p) => p.files.pending_paths(),
            Self::Watch(w) => w.files.pending_paths(),
            Self::Journal(_) => Vec::new(),
        }
    }

    /// Wait until there may be something to read. Cancel safe.
    pub async fn wait(&mut self) {
        match self {
            Self::Poll(p) => p.wait().await,
            Self::Watch(w) => w.wait().await,
            Self::Journal(j) => j.wait().await,
        }
    }

    /// Read what is available and feed it to `filter`. Returns the number
    /// of lines processed.
    pub async fn process(&mut self, filter: &mut Filter, stop: &CancellationToken) -> usize {
        match self {
            Self::Poll(p) => p.process(filter, stop).await,
            Self::Watch(w) => w.process(filter, stop).await,
            Self::Journal(j) => j.process(filter, stop).await,
        }
    }

    /// Whether the last pass left nothing pending. A file pass always reads
    /// to the end of every file; the journal may stop mid-backlog.
    pub fn drained(&self) -> bool {
        match self {
            Self::Poll(_) | Self::Watch(_) => true,
            Self::Journal(j) => j.backlog_drained(),
        }
    }

    /// Release external resources (the `journalctl` child, the cursor).
    pub fn close(&mut self) {
        if let Self::Journal(j) = self {
            j.close();
        }
    }

    /// Read → match loop of one filter until `stop` is cancelled.
    ///
    /// The first pass that leaves nothing pending ends the catch-up phase
    /// and switches the filter into operation mode.
    pub async fn run(&mut self, filter: &mut Filter, stop: CancellationToken) {
        let mut caught_up = false;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.wait() => {}
            }
            if stop.is_cancelled() {
                break;
            }
            filter.resume_if_due();
            self.process(filter, &stop).await;
            if !caught_up && self.drained() && !stop.is_cancelled() {
                caught_up = true;
                filter.set_in_operation(true);
                info!(jail = %filter.jail(), backend = %self.kind(), "Catch-up done, filter in operation");
            }
        }
        self.close();
    }
}
