//! Address sets with CIDR-aware membership.

use super::IpAddr;
use crate::clock::Clock;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Minimum seconds between two modification checks of an address file.
pub const FILE_RECHECK_INTERVAL: f64 = 60.0;

/// Ordered set of addresses and networks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAddrSet {
    entries: Vec<IpAddr>,
}

impl IpAddrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the set sorted and free of duplicates.
    pub fn insert(&mut self, ip: IpAddr) {
        if let Err(pos) = self.entries.binary_search(&ip) {
            self.entries.insert(pos, ip);
        }
    }

    pub fn remove(&mut self, ip: &IpAddr) -> bool {
        match self.entries.binary_search(ip) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// True if `ip` equals an entry or lies inside one of its networks.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.iter().any(|e| e == ip || ip.is_in_net(e))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<IpAddr> for IpAddrSet {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut set = IpAddrSet::new();
        for ip in iter {
            set.insert(ip);
        }
        set
    }
}

/// Parse the address-file format: comma or whitespace separated tokens,
/// `#` and `;` start a comment.
pub fn parse_addr_list(content: &str) -> IpAddrSet {
    let mut set = IpAddrSet::new();
    for line in content.lines() {
        let line = match line.find(['#', ';']) {
            Some(pos) => &line[..pos],
            None => line,
        };
        for token in line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match token.parse::<IpAddr>() {
                Ok(ip) if ip.is_valid() => set.insert(ip),
                Ok(_) => debug!(token = %token, "Skipping non-address token"),
                Err(e) => warn!(token = %token, error = %e, "Skipping invalid address"),
            }
        }
    }
    set
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: Option<SystemTime>,
    size: u64,
}

#[derive(Debug, Default)]
struct CheckState {
    stamp: Option<FileStamp>,
    last_check: Option<f64>,
}

/// Address set backed by a file, reloaded when the file changes.
///
/// The file is stat'ed at most once per [`FILE_RECHECK_INTERVAL`] of clock
/// time, not on every lookup.
#[derive(Debug)]
pub struct FileIpAddrSet {
    path: PathBuf,
    clock: Clock,
    set: RwLock<Arc<IpAddrSet>>,
    check: Mutex<CheckState>,
}

impl FileIpAddrSet {
    pub fn new(path: impl Into<PathBuf>, clock: Clock) -> Self {
        Self {
            path: path.into(),
            clock,
            set: RwLock::new(Arc::new(IpAddrSet::new())),
            check: Mutex::new(CheckState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file and reload it if it changed.
    ///
    /// Returns `None` when the check was skipped because the previous one is
    /// too recent, otherwise whether the file changed (the first check
    /// always counts as a change).
    pub fn is_modified(&self) -> Option<bool> {
        let now = self.clock.now();
        let mut check = self.check.lock();
        if check.last_check.is_some_and(|last| now - last < FILE_RECHECK_INTERVAL) {
            return None;
        }
        check.last_check = Some(now);

        let stamp = std::fs::metadata(&self.path).ok().map(|m| FileStamp {
            mtime: m.modified().ok(),
            size: m.len(),
        });
        if check.stamp.is_some() && check.stamp == stamp {
            return Some(false);
        }
        check.stamp = stamp;
        drop(check);

        self.reload();
        Some(true)
    }

    fn reload(&self) {
        let set = match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_addr_list(&content),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unable to read address file");
                IpAddrSet::new()
            }
        };
        info!(path = %self.path.display(), entries = set.len(), "Address file loaded");
        *self.set.write() = Arc::new(set);
    }

    /// Current contents, refreshing first if due.
    pub fn snapshot(&self) -> Arc<IpAddrSet> {
        self.is_modified();
        Arc::clone(&self.set.read())
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.snapshot().contains(ip)
    }

    fn check_due(&self) -> bool {
        let now = self.clock.now();
        !self
            .check
            .lock()
            .last_check
            .is_some_and(|last| now - last < FILE_RECHECK_INTERVAL)
    }

    /// [`Self::snapshot`] for async callers. A due file check runs on the
    /// blocking pool.
    pub async fn current(self: &Arc<Self>) -> Arc<IpAddrSet> {
        if !self.check_due() {
            return Arc::clone(&self.set.read());
        }
        let this = Arc::clone(self);
        match tokio::task::spawn_blocking(move || this.snapshot()).await {
            Ok(set) => set,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Address file check failed");
                Arc::clone(&self.set.read())
            }
        }
    }
}
