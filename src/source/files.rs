//! Followed files shared by the polling and watch backends.

use super::SeekPolicy;
use super::container::FileContainer;
use crate::filter::Filter;
use encoding_rs::Encoding;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub(crate) struct FileTable {
    containers: Vec<FileContainer>,
    /// Paths that vanished or became unreadable, retried every cycle.
    pending: Vec<PathBuf>,
}

impl FileTable {
    /// Start following `path`. Returns `false` if it is already followed.
    pub fn add_path(
        &mut self,
        path: &Path,
        seek: SeekPolicy,
        filter: &mut Filter,
    ) -> Result<bool, crate::error::SourceError> {
        if self.contains_path(path) {
            debug!(jail = %filter.jail(), path = %path.display(), "Log path already followed");
            return Ok(false);
        }
        let encoding = filter.log_encoding();
        let container = FileContainer::open(path, seek, encoding, filter.date_detector())?;
        info!(jail = %filter.jail(), path = %path.display(), "Added logfile");
        self.containers.push(container);
        Ok(true)
    }

    pub fn del_path(&mut self, path: &Path) -> bool {
        let before = self.containers.len() + self.pending.len();
        self.containers.retain(|c| c.path() != path);
        self.pending.retain(|p| p != path);
        before != self.containers.len() + self.pending.len()
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.containers.iter().any(|c| c.path() == path) || self.pending.iter().any(|p| p == path)
    }

    pub fn log_paths(&self) -> Vec<PathBuf> {
        self.containers
            .iter()
            .map(|c| c.path().to_path_buf())
            .chain(self.pending.iter().cloned())
            .collect()
    }

    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.pending.clone()
    }

    /// Read every followed file and feed new lines to `filter`, in file
    /// order. Unreadable files move to the pending set. File I/O runs on the
    /// blocking pool.
    pub async fn read(&mut self, filter: &mut Filter, stop: &CancellationToken) -> usize {
        let mut processed = 0;
        let encoding = filter.log_encoding();
        let mut kept = Vec::with_capacity(self.containers.len());
        let mut queue = std::mem::take(&mut self.containers).into_iter();

        for container in queue.by_ref() {
            let path = container.path().to_path_buf();
            match read_container(container, encoding, filter, stop, &mut processed).await {
                Some(container) => kept.push(container),
                None => self.pending.push(path),
            }
            if stop.is_cancelled() {
                break;
            }
        }

        kept.extend(queue);
        self.containers = kept;
        processed
    }

    /// Try to reopen pending paths. A path that comes back is a new file
    /// and is read from its start.
    pub fn retry_pending(&mut self, filter: &mut Filter) {
        if self.pending.is_empty() {
            return;
        }
        let encoding = filter.log_encoding();
        let mut still = Vec::with_capacity(self.pending.len());
        for path in std::mem::take(&mut self.pending) {
            match FileContainer::open(&path, SeekPolicy::Head, encoding, filter.date_detector()) {
                Ok(container) => {
                    info!(jail = %filter.jail(), path = %path.display(), "Log file is available again");
                    self.containers.push(container);
                }
                Err(e) => {
                    debug!(jail = %filter.jail(), path = %path.display(), error = %e, "Log file still unavailable");
                    still.push(path);
                }
            }
        }
        self.pending = still;
    }
}

/// Feed `container`'s new lines to `filter` until its end or `stop`.
/// `None` when the file became unreadable.
async fn read_container(
    mut container: FileContainer,
    encoding: &'static Encoding,
    filter: &mut Filter,
    stop: &CancellationToken,
    processed: &mut usize,
) -> Option<FileContainer> {
    while !stop.is_cancelled() {
        let read = tokio::task::spawn_blocking(move || {
            let lines = container.read_lines(encoding);
            (container, lines)
        })
        .await;
        let (back, lines) = match read {
            Ok(read) => read,
            Err(e) => {
                error!(jail = %filter.jail(), error = %e, "Log read task failed");
                return None;
            }
        };
        container = back;
        match lines {
            Ok(lines) => {
                for line in &lines {
                    filter.process_line(line).await;
                }
                *processed += lines.len();
                if !container.has_more() {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    jail = %filter.jail(),
                    error = %e,
                    "Unable to open {}",
                    container.path().display()
                );
                filter.record_error(e.error_code(), &e);
                return None;
            }
        }
    }
    Some(container)
}
