//! Integration test common infrastructure.
//!
//! Builds filters over a pinned clock and a static resolver, and writes
//! log files into temporary directories.

#![allow(dead_code)]

use banwatch::addr::dns::{DnsUtils, StaticResolver};
use banwatch::clock::Clock;
use banwatch::failmanager::FailManager;
use banwatch::filter::Filter;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 2005-08-14 10:00:00 UTC, i.e. "Aug 14 12:00:00" in the logs' UTC+0200.
pub const NOW: f64 = 1_124_013_600.0;

/// Zone of the syslog lines used throughout the tests.
pub const LOG_ZONE: &str = "UTC+0200";

pub struct TestJail {
    pub clock: Clock,
    pub dns: Arc<DnsUtils>,
    pub fail_manager: Arc<FailManager>,
    pub filter: Filter,
}

impl TestJail {
    pub fn new(name: &str) -> Self {
        Self::with_resolver(name, StaticResolver::new())
    }

    pub fn with_resolver(name: &str, resolver: StaticResolver) -> Self {
        let clock = Clock::fixed(NOW);
        let dns = Arc::new(DnsUtils::new(Arc::new(resolver), clock.clone()));
        let fail_manager = Arc::new(FailManager::new(clock.clone()));
        let mut filter = Filter::new(name, fail_manager.clone(), dns.clone());
        filter.set_log_time_zone(Some(LOG_ZONE)).unwrap();
        filter.set_ignore_self(false);
        Self {
            clock,
            dns,
            fail_manager,
            filter,
        }
    }

    /// Feed lines in order and collect every identity reported.
    pub async fn feed(&mut self, lines: &[&str]) -> Vec<String> {
        let mut found = Vec::new();
        for line in lines {
            for ip in self.filter.process_line(line).await {
                found.push(ip.to_string());
            }
        }
        found
    }

    /// Pop every ready ticket as (identity, attempt count).
    pub fn drain_tickets(&self) -> Vec<(String, usize)> {
        let mut tickets = Vec::new();
        while let Ok(ticket) = self.fail_manager.to_ban() {
            tickets.push((ticket.identity().to_string(), ticket.attempt_count()));
        }
        tickets
    }
}

pub fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    path
}

pub fn append_log(path: &Path, lines: &[&str]) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}
