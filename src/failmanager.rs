//! Sliding-window failure aggregation.
//!
//! Filters report every failure here. Once an identity collects `max_retry`
//! attempts inside `find_time`, a [`FailTicket`] is queued for the jail and
//! the identity starts over with an empty window.
//!
//! Several filter workers may share one manager; all state sits behind a
//! single `parking_lot` mutex so window trimming and ticket creation are
//! atomic with respect to each other.

use crate::addr::IpAddr;
use crate::clock::Clock;
use crate::error::FailManagerError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;
use tracing::{debug, info};

pub const DEFAULT_MAX_RETRY: usize = 3;
pub const DEFAULT_FIND_TIME: f64 = 600.0;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub time: f64,
    /// Matched line(s); more than one for multi-line matches.
    pub lines: Vec<String>,
}

/// Aggregate of failures for one identity, ready to ban.
///
/// Immutable once issued.
#[derive(Debug, Clone, PartialEq)]
pub struct FailTicket {
    identity: IpAddr,
    attempts: Vec<Attempt>,
    time: f64,
    matches: Vec<String>,
    data: HashMap<String, String>,
}

impl FailTicket {
    pub fn identity(&self) -> &IpAddr {
        &self.identity
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Timestamp of the latest attempt.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Attempts in timestamp order.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Matched lines, oldest first.
    pub fn matches(&self) -> &[String] {
        &self.matches
    }

    /// Named captures of the matches (e.g. `F-USER`).
    pub fn data(&self) -> &HashMap<String, String> {
        &self.data
    }
}

#[derive(Debug, Default)]
struct FailData {
    attempts: Vec<Attempt>,
    data: HashMap<String, String>,
}

#[derive(Debug)]
struct Inner {
    max_retry: usize,
    find_time: f64,
    max_matches: Option<usize>,
    failures: HashMap<IpAddr, FailData>,
    tickets: VecDeque<FailTicket>,
    fail_total: u64,
}

/// Failure aggregation shared by filter workers.
#[derive(Debug)]
pub struct FailManager {
    inner: Mutex<Inner>,
    clock: Clock,
    ready: Notify,
}

impl FailManager {
    pub fn new(clock: Clock) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_retry: DEFAULT_MAX_RETRY,
                find_time: DEFAULT_FIND_TIME,
                max_matches: None,
                failures: HashMap::new(),
                tickets: VecDeque::new(),
                fail_total: 0,
            }),
            clock,
            ready: Notify::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn set_max_retry(&self, max_retry: usize) {
        self.inner.lock().max_retry = max_retry.max(1);
    }

    pub fn max_retry(&self) -> usize {
        self.inner.lock().max_retry
    }

    pub fn set_find_time(&self, secs: f64) {
        self.inner.lock().find_time = secs;
    }

    pub fn find_time(&self) -> f64 {
        self.inner.lock().find_time
    }

    /// Bound the matched lines carried by a ticket; `None` keeps all.
    pub fn set_max_matches(&self, max_matches: Option<usize>) {
        self.inner.lock().max_matches = max_matches;
    }

    pub fn max_matches(&self) -> Option<usize> {
        self.inner.lock().max_matches
    }

    /// Record a failure and return the identity's attempt count in the
    /// current window.
    ///
    /// Attempts older than `now - find_time` are discarded. Reaching
    /// `max_retry` queues a ticket and resets the identity.
    pub fn add_failure(
        &self,
        identity: IpAddr,
        time: f64,
        lines: Vec<String>,
        data: HashMap<String, String>,
    ) -> usize {
        let cutoff = self.clock.now();
        let mut inner = self.inner.lock();
        let cutoff = cutoff - inner.find_time;
        let max_retry = inner.max_retry;
        inner.fail_total += 1;

        let entry = inner.failures.entry(identity.clone()).or_default();
        let pos = entry.attempts.partition_point(|a| a.time <= time);
        entry.attempts.insert(pos, Attempt { time, lines });
        entry.attempts.retain(|a| a.time >= cutoff);
        entry.data.extend(data);
        let count = entry.attempts.len();

        if count == 0 {
            debug!(identity = %identity, time = time, "Failure outside of find time");
            inner.failures.remove(&identity);
        } else if count >= max_retry {
            let Some(fail) = inner.failures.remove(&identity) else {
                return count;
            };
            let ticket = Self::make_ticket(identity, fail, inner.max_matches);
            info!(
                identity = %ticket.identity,
                attempts = ticket.attempt_count(),
                "Ticket ready"
            );
            inner.tickets.push_back(ticket);
            drop(inner);
            self.ready.notify_one();
        }
        count
    }

    fn make_ticket(identity: IpAddr, fail: FailData, max_matches: Option<usize>) -> FailTicket {
        let time = fail
            .attempts
            .iter()
            .map(|a| a.time)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut matches: Vec<String> = fail
            .attempts
            .iter()
            .flat_map(|a| a.lines.iter().cloned())
            .collect();
        if let Some(max) = max_matches {
            let excess = matches.len().saturating_sub(max);
            matches.drain(..excess);
        }
        FailTicket {
            identity,
            attempts: fail.attempts,
            time,
            matches,
            data: fail.data,
        }
    }

    /// Pop the oldest ready ticket.
    pub fn to_ban(&self) -> Result<FailTicket, FailManagerError> {
        self.inner
            .lock()
            .tickets
            .pop_front()
            .ok_or(FailManagerError::Empty)
    }

    /// Wait until a ticket may be ready. Follow with [`FailManager::to_ban`].
    pub async fn ticket_ready(&self) {
        self.ready.notified().await;
    }

    /// Ready tickets not yet popped.
    pub fn size(&self) -> usize {
        self.inner.lock().tickets.len()
    }

    /// `(identities with attempts, total attempts)`.
    pub fn fail_count(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let total = inner.failures.values().map(|f| f.attempts.len()).sum();
        (inner.failures.len(), total)
    }

    /// All failures ever recorded.
    pub fn fail_total(&self) -> u64 {
        self.inner.lock().fail_total
    }

    /// Current per-identity counts, for diagnostics.
    pub fn failures(&self) -> Vec<(IpAddr, usize)> {
        let inner = self.inner.lock();
        let mut v: Vec<(IpAddr, usize)> = inner
            .failures
            .iter()
            .map(|(ip, f)| (ip.clone(), f.attempts.len()))
            .collect();
        v.sort();
        v
    }

    /// Drop attempts that fell out of the window.
    pub fn cleanup(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let cutoff = now - inner.find_time;
        inner.failures.retain(|_, f| {
            f.attempts.retain(|a| a.time >= cutoff);
            !f.attempts.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_124_013_600.0;

    fn manager() -> FailManager {
        FailManager::new(Clock::fixed(NOW))
    }

    fn fail(fm: &FailManager, ip: &str, time: f64) -> usize {
        fm.add_failure(IpAddr::parse(ip), time, vec![format!("line {time}")], HashMap::new())
    }

    #[test]
    fn test_ticket_after_max_retry() {
        let fm = manager();
        assert_eq!(fail(&fm, "193.168.0.128", NOW - 3.0), 1);
        assert_eq!(fail(&fm, "193.168.0.128", NOW - 2.0), 2);
        assert_eq!(fm.to_ban(), Err(FailManagerError::Empty));
        assert_eq!(fail(&fm, "193.168.0.128", NOW - 1.0), 3);

        let ticket = fm.to_ban().unwrap();
        assert_eq!(ticket.identity(), &IpAddr::parse("193.168.0.128"));
        assert_eq!(ticket.attempt_count(), 3);
        assert_eq!(ticket.time(), NOW - 1.0);
        assert_eq!(ticket.matches().len(), 3);
        assert_eq!(fm.to_ban(), Err(FailManagerError::Empty));

        // fresh window after the ticket was issued
        assert_eq!(fail(&fm, "193.168.0.128", NOW), 1);
        assert_eq!(fm.fail_count(), (1, 1));
        assert_eq!(fm.fail_total(), 4);
    }

    #[test]
    fn test_old_attempts_trimmed() {
        let fm = manager();
        fm.set_find_time(10.0);
        assert_eq!(fail(&fm, "192.0.2.1", NOW - 100.0), 0);
        assert_eq!(fail(&fm, "192.0.2.1", NOW - 5.0), 1);
        assert_eq!(fm.fail_count(), (1, 1));
    }

    #[test]
    fn test_out_of_order_arrival() {
        let fm = manager();
        fm.set_max_retry(5);
        fail(&fm, "192.0.2.1", NOW);
        fail(&fm, "192.0.2.1", NOW - 2.0);
        fail(&fm, "192.0.2.1", NOW - 1.0);
        // a backward-corrected clock keeps future attempts
        fm.clock().set(NOW - 100.0);
        assert_eq!(fail(&fm, "192.0.2.1", NOW - 100.0), 4);
    }

    #[test]
    fn test_fail_count_snapshot() {
        let fm = manager();
        fail(&fm, "192.0.2.1", NOW);
        fail(&fm, "192.0.2.1", NOW);
        fail(&fm, "192.0.2.2", NOW);
        fail(&fm, "192.0.2.2", NOW);
        assert_eq!(fm.fail_count(), (2, 4));
        assert_eq!(
            fm.failures(),
            vec![(IpAddr::parse("192.0.2.1"), 2), (IpAddr::parse("192.0.2.2"), 2)]
        );
    }

    #[test]
    fn test_max_matches_and_data() {
        let fm = manager();
        fm.set_max_matches(Some(2));
        let mut data = HashMap::new();
        data.insert("F-USER".to_string(), "kevin".to_string());
        for i in 0..3 {
            fm.add_failure(
                IpAddr::raw("kevin"),
                NOW - 3.0 + i as f64,
                vec![format!("l{i}")],
                data.clone(),
            );
        }
        let ticket = fm.to_ban().unwrap();
        assert_eq!(ticket.matches(), ["l1", "l2"]);
        assert_eq!(ticket.data().get("F-USER").map(String::as_str), Some("kevin"));
        assert_eq!(ticket.attempt_count(), 3);
    }

    #[test]
    fn test_cleanup() {
        let fm = manager();
        fail(&fm, "192.0.2.1", NOW);
        fm.clock().advance(DEFAULT_FIND_TIME + 1.0);
        fm.cleanup();
        assert_eq!(fm.fail_count(), (0, 0));
    }

    #[tokio::test]
    async fn test_ticket_ready_notifies() {
        let fm = std::sync::Arc::new(manager());
        let waiter = {
            let fm = std::sync::Arc::clone(&fm);
            tokio::spawn(async move {
                fm.ticket_ready().await;
                fm.to_ban()
            })
        };
        for _ in 0..3 {
            fail(&fm, "192.0.2.3", NOW);
        }
        let ticket = waiter.await.unwrap().unwrap();
        assert_eq!(ticket.identity().to_string(), "192.0.2.3");
    }
}
