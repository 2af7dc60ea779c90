//! Per-jail line filter.
//!
//! A [`Filter`] turns log lines into failures:
//!
//! 1. locate the timestamp with its [`DateDetector`]
//! 2. drop the line if an ignore-regex matches
//! 3. find the first fail-regex that captures an identity, pairing
//!    multi-line patterns with an earlier line from the window
//! 4. resolve the captured token to addresses according to [`UseDns`]
//! 5. consult the [`IgnoreList`] and hand the rest to the [`FailManager`]
//!
//! Configuration calls fail synchronously with a [`FilterError`]. Problems
//! with individual lines are only logged; too many of them within
//! [`FILTER_ERROR_WINDOW`] put the filter idle for a while.

pub mod buffer;
pub mod failregex;
pub mod ignore;

pub use buffer::{BufferedLine, DEFAULT_MAX_LINES, LineBuffer};
pub use ignore::{IgnoreCacheConfig, IgnoreList, IgnoreSource};
pub use failregex::{FailRegex, IgnoreRegex, RegexMatch};

use crate::addr::{DnsUtils, IpAddr, UseDns};
use crate::clock::Clock;
use crate::datedetector::{DateDetector, TimeAnomaly, classify_offset};
use crate::error::FilterError;
use crate::failmanager::FailManager;
use crate::metrics;
use encoding_rs::{Encoding, UTF_8};
use failregex::{ADDR_GROUP, HOST_GROUP, ID_GROUP, USER_GROUP};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Errors within [`FILTER_ERROR_WINDOW`] that put the filter idle.
pub const FILTER_ERROR_THRESHOLD: usize = 100;
pub const FILTER_ERROR_WINDOW: f64 = 30.0;
/// Default idle period after too many errors.
pub const DEFAULT_ERROR_BACKOFF: f64 = 30.0;

/// Matches the jail name in log output.
struct Jail<'a>(&'a str);

impl fmt::Display for Jail<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

fn format_time(time: f64) -> String {
    chrono::DateTime::from_timestamp(time.floor() as i64, 0)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| time.to_string())
}

/// Line filter of one jail.
pub struct Filter {
    jail: String,
    fail_regexes: Vec<FailRegex>,
    ignore_regexes: Vec<IgnoreRegex>,
    ignore: IgnoreList,
    use_dns: UseDns,
    buffer: LineBuffer,
    date_detector: DateDetector,
    encoding: &'static Encoding,
    fail_manager: Arc<FailManager>,
    dns: Arc<DnsUtils>,
    in_operation: bool,
    /// Clock anomaly warned about for the latest line, if any.
    last_time_warning: Option<TimeAnomaly>,
    active: bool,
    idle: bool,
    idle_until: Option<f64>,
    error_backoff: f64,
    errors: VecDeque<f64>,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("jail", &self.jail)
            .field("fail_regexes", &self.fail_regexes())
            .field("ignore_regexes", &self.ignore_regexes())
            .field("ignore", &self.ignore)
            .field("use_dns", &self.use_dns)
            .field("in_operation", &self.in_operation)
            .field("idle", &self.is_idle())
            .finish()
    }
}

impl Filter {
    /// Filter for `jail` reporting to `fail_manager`. Time comes from the
    /// fail manager's clock.
    pub fn new(jail: impl Into<String>, fail_manager: Arc<FailManager>, dns: Arc<DnsUtils>) -> Self {
        let clock = fail_manager.clock().clone();
        Self {
            jail: jail.into(),
            fail_regexes: Vec::new(),
            ignore_regexes: Vec::new(),
            ignore: IgnoreList::default(),
            use_dns: UseDns::default(),
            buffer: LineBuffer::default(),
            date_detector: DateDetector::new(clock),
            encoding: UTF_8,
            fail_manager,
            dns,
            in_operation: false,
            last_time_warning: None,
            active: false,
            idle: false,
            idle_until: None,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            errors: VecDeque::new(),
        }
    }

    pub fn jail(&self) -> &str {
        &self.jail
    }

    pub fn clock(&self) -> &Clock {
        self.fail_manager.clock()
    }

    pub fn fail_manager(&self) -> &Arc<FailManager> {
        &self.fail_manager
    }

    pub fn dns(&self) -> &Arc<DnsUtils> {
        &self.dns
    }

    // ========================================================================
    // Regex tables
    // ========================================================================

    pub fn add_fail_regex(&mut self, pattern: &str) -> Result<(), FilterError> {
        let regex = FailRegex::new(pattern).inspect_err(|e| {
            error!("{} Unable to add fail regex {:?}: {}", Jail(&self.jail), pattern, e);
        })?;
        self.fail_regexes.push(regex);
        Ok(())
    }

    pub fn del_fail_regex(&mut self, index: usize) -> Result<(), FilterError> {
        if index >= self.fail_regexes.len() {
            error!("Cannot remove regular expression. Index {} is not valid", index);
            return Err(FilterError::InvalidIndex(index));
        }
        self.fail_regexes.remove(index);
        Ok(())
    }

    pub fn fail_regexes(&self) -> Vec<&str> {
        self.fail_regexes.iter().map(FailRegex::pattern).collect()
    }

    pub fn add_ignore_regex(&mut self, pattern: &str) -> Result<(), FilterError> {
        let regex = IgnoreRegex::new(pattern).inspect_err(|e| {
            error!("{} Unable to add ignore regex {:?}: {}", Jail(&self.jail), pattern, e);
        })?;
        self.ignore_regexes.push(regex);
        Ok(())
    }

    pub fn del_ignore_regex(&mut self, index: usize) -> Result<(), FilterError> {
        if index >= self.ignore_regexes.len() {
            error!("Cannot remove regular expression. Index {} is not valid", index);
            return Err(FilterError::InvalidIndex(index));
        }
        self.ignore_regexes.remove(index);
        Ok(())
    }

    pub fn ignore_regexes(&self) -> Vec<&str> {
        self.ignore_regexes.iter().map(IgnoreRegex::pattern).collect()
    }

    // ========================================================================
    // Ignore list
    // ========================================================================

    pub fn add_ignore_ip(&mut self, entry: &str) -> Result<(), FilterError> {
        self.ignore.add(entry, &self.dns)?;
        debug!("{} Add {:?} to ignore list", Jail(&self.jail), entry);
        Ok(())
    }

    pub fn del_ignore_ip(&mut self, entry: &str) -> bool {
        self.ignore.remove(entry)
    }

    pub fn ignore_ips(&self) -> Vec<String> {
        self.ignore.entries().map(str::to_string).collect()
    }

    pub fn set_ignore_self(&mut self, value: bool) {
        self.ignore.set_ignore_self(value);
    }

    pub fn ignore_self(&self) -> bool {
        self.ignore.ignore_self()
    }

    pub fn set_ignore_command(&mut self, command: Option<String>) {
        self.ignore.set_command(command);
    }

    pub fn ignore_command(&self) -> Option<&str> {
        self.ignore.command()
    }

    pub fn set_ignore_command_timeout(&mut self, timeout: Duration) {
        self.ignore.set_command_timeout(timeout);
    }

    pub fn set_ignore_cache(&mut self, config: Option<IgnoreCacheConfig>) {
        self.ignore.set_cache(config);
    }

    pub fn ignore_cache(&self) -> Option<&IgnoreCacheConfig> {
        self.ignore.cache_config()
    }

    /// Whether `ip` is ignored, logging the deciding source.
    pub async fn in_ignore_ip_list(
        &self,
        ip: &IpAddr,
        data: &HashMap<String, String>,
    ) -> Option<IgnoreSource> {
        let source = self.ignore.check(ip, data, &self.dns).await?;
        info!("{} Ignore {} by {}", Jail(&self.jail), ip, source);
        metrics::record_ignored(&self.jail, &source.to_string());
        Some(source)
    }

    // ========================================================================
    // Matching settings
    // ========================================================================

    pub fn set_use_dns(&mut self, use_dns: UseDns) {
        self.use_dns = use_dns;
    }

    pub fn use_dns(&self) -> UseDns {
        self.use_dns
    }

    pub fn set_max_lines(&mut self, max_lines: usize) {
        self.buffer.set_max_lines(max_lines);
    }

    pub fn max_lines(&self) -> usize {
        self.buffer.max_lines()
    }

    /// One date pattern, or `None` for auto-detection.
    pub fn set_date_pattern(&mut self, pattern: Option<&str>) -> Result<(), FilterError> {
        match pattern {
            Some(p) => self.set_date_patterns(&[p]),
            None => self.set_date_patterns(&[]),
        }
    }

    pub fn set_date_patterns(&mut self, patterns: &[&str]) -> Result<(), FilterError> {
        Ok(self.date_detector.set_patterns(patterns)?)
    }

    pub fn date_patterns(&self) -> Option<Vec<String>> {
        self.date_detector.patterns()
    }

    pub fn set_log_time_zone(&mut self, tz: Option<&str>) -> Result<(), FilterError> {
        Ok(self.date_detector.set_default_tz(tz)?)
    }

    pub fn log_time_zone(&self) -> Option<&str> {
        self.date_detector.default_tz()
    }

    pub fn date_detector(&mut self) -> &mut DateDetector {
        &mut self.date_detector
    }

    /// Set the log encoding by label. `auto` selects UTF-8.
    pub fn set_log_encoding(&mut self, label: &str) -> Result<(), FilterError> {
        let label = label.trim();
        self.encoding = if label.eq_ignore_ascii_case("auto") {
            UTF_8
        } else {
            Encoding::for_label(label.as_bytes())
                .ok_or_else(|| FilterError::UnknownEncoding(label.to_string()))?
        };
        Ok(())
    }

    pub fn log_encoding(&self) -> &'static Encoding {
        self.encoding
    }

    // ========================================================================
    // Fail manager passthroughs
    // ========================================================================

    pub fn set_max_retry(&mut self, max_retry: usize) {
        self.fail_manager.set_max_retry(max_retry);
    }

    pub fn max_retry(&self) -> usize {
        self.fail_manager.max_retry()
    }

    pub fn set_find_time(&mut self, secs: f64) {
        self.fail_manager.set_find_time(secs);
    }

    pub fn find_time(&self) -> f64 {
        self.fail_manager.find_time()
    }

    pub fn set_max_matches(&mut self, max_matches: Option<usize>) {
        self.fail_manager.set_max_matches(max_matches);
    }

    pub fn max_matches(&self) -> Option<usize> {
        self.fail_manager.max_matches()
    }

    // ========================================================================
    // State flags
    // ========================================================================

    /// Live tailing: timestamps are checked for clock anomalies.
    pub fn set_in_operation(&mut self, value: bool) {
        self.in_operation = value;
    }

    pub fn in_operation(&self) -> bool {
        self.in_operation
    }

    /// Anomaly warned about while processing the latest dated line.
    pub fn last_time_warning(&self) -> Option<TimeAnomaly> {
        self.last_time_warning
    }

    pub fn set_active(&mut self, value: bool) {
        self.active = value;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Suspend processing until cleared. Clears any error back-off too.
    pub fn set_idle(&mut self, value: bool) {
        self.idle = value;
        self.idle_until = None;
    }

    pub fn is_idle(&self) -> bool {
        self.idle || self.idle_until.is_some_and(|until| self.clock().now() < until)
    }

    pub fn set_error_backoff(&mut self, secs: f64) {
        self.error_backoff = secs;
    }

    /// Leave an expired error back-off. Returns whether the filter resumed.
    pub fn resume_if_due(&mut self) -> bool {
        match self.idle_until {
            Some(until) if self.clock().now() >= until => {
                self.idle_until = None;
                info!("{} Resuming after error back-off", Jail(&self.jail));
                true
            }
            _ => false,
        }
    }

    /// Count a per-line or per-record error. Too many within the window put
    /// the filter idle for the back-off period.
    pub fn record_error(&mut self, kind: &str, err: &dyn fmt::Display) {
        let now = self.clock().now();
        metrics::record_error(&self.jail, kind);
        warn!("{} Error processing line: {}", Jail(&self.jail), err);

        self.errors.push_back(now);
        while self
            .errors
            .front()
            .is_some_and(|t| now - t > FILTER_ERROR_WINDOW)
        {
            self.errors.pop_front();
        }
        if self.errors.len() >= FILTER_ERROR_THRESHOLD {
            error!(
                "{} Too many errors at once ({}), going idle for {}s",
                Jail(&self.jail),
                self.errors.len(),
                self.error_backoff
            );
            self.errors.clear();
            self.idle_until = Some(now + self.error_backoff);
        }
    }

    // ========================================================================
    // Line processing
    // ========================================================================

    /// Process one line read from a log file. Returns the identities
    /// reported to the fail manager.
    pub async fn process_line(&mut self, line: &str) -> Vec<IpAddr> {
        self.process_event(line, None).await
    }

    /// Process one line. `event_time` (journal records) bypasses date
    /// detection.
    pub async fn process_event(&mut self, line: &str, event_time: Option<f64>) -> Vec<IpAddr> {
        if self.is_idle() {
            return Vec::new();
        }
        let started = Instant::now();
        let found = self.process_inner(line, event_time).await;
        metrics::record_line(&self.jail, started.elapsed().as_secs_f64());
        found
    }

    async fn process_inner(&mut self, line: &str, event_time: Option<f64>) -> Vec<IpAddr> {
        let line = line.trim_end_matches(['\r', '\n']);
        let now = self.clock().now();

        let (time, text) = match event_time {
            Some(t) => (Some(t), line.to_string()),
            None => match self.date_detector.match_time(line) {
                Some(m) => (Some(m.time), format!("{}{}", &line[..m.start], &line[m.end..])),
                None => (None, line.to_string()),
            },
        };

        // In operation a line is never dropped for its age and a far-off
        // time counts as now. find_time only filters the catch-up backlog.
        let time = match time {
            Some(t) if self.in_operation => {
                self.last_time_warning = None;
                if event_time.is_none() {
                    if let Some(kind) = self.date_detector.check_anomaly(t) {
                        metrics::record_time_anomaly(&self.jail, kind.as_str());
                        self.last_time_warning = Some(kind);
                    }
                }
                if classify_offset(now - t).is_some() {
                    debug!("{} Line dated {} counted at current time {}", Jail(&self.jail), t, now);
                    Some(now)
                } else {
                    Some(t)
                }
            }
            Some(t) => {
                let find_time = self.fail_manager.find_time();
                if t < now - find_time {
                    debug!(
                        "{} Ignore line since time {} < {} - {}",
                        Jail(&self.jail),
                        t,
                        now,
                        find_time
                    );
                    return Vec::new();
                }
                Some(t)
            }
            None => None,
        };

        self.buffer.push(BufferedLine {
            text,
            line: line.to_string(),
            time: time.unwrap_or(now),
        });
        if let Some(re) = self.ignore_regexes.iter().find(|re| re.is_match(&self.buffer)) {
            debug!("{} Matched ignoreregex {:?}", Jail(&self.jail), re.pattern());
            self.buffer.pop_last();
            return Vec::new();
        }

        let Some((matched, identities)) = self.find_failure().await else {
            return Vec::new();
        };

        let time = match time {
            Some(t) => t,
            None => {
                warn!(
                    "{} Found a match but no valid date/time found for {:?}.",
                    Jail(&self.jail),
                    line
                );
                if !self.in_operation {
                    info!("{} Match without a timestamp: skipped during catch-up", Jail(&self.jail));
                    return Vec::new();
                }
                info!("{} Match without a timestamp: using current time", Jail(&self.jail));
                now
            }
        };

        let mut lines = Vec::with_capacity(2);
        if let Some(idx) = matched.anchor {
            if let Some(anchor) = self.buffer.remove(idx) {
                lines.push(anchor.line);
            }
        }
        lines.push(line.to_string());

        let data: HashMap<String, String> = matched
            .groups
            .into_iter()
            .filter(|(k, _)| k != HOST_GROUP && k != ADDR_GROUP)
            .collect();
        self.report(identities, time, lines, data).await
    }

    /// First fail-regex match that captures an identity, with the resolved
    /// identities.
    async fn find_failure(&self) -> Option<(RegexMatch, Vec<IpAddr>)> {
        for re in &self.fail_regexes {
            let Some(matched) = re.match_buffer(&self.buffer) else {
                continue;
            };
            if let Some(identities) = self.resolve_identities(&matched.groups).await {
                debug!("{} Matched {:?}", Jail(&self.jail), re.pattern());
                return Some((matched, identities));
            }
        }
        None
    }

    async fn resolve_identities(&self, groups: &HashMap<String, String>) -> Option<Vec<IpAddr>> {
        if let Some(host) = groups.get(HOST_GROUP) {
            return Some(self.dns.text_to_ip(host, self.use_dns).await);
        }
        if let Some(addr) = groups.get(ADDR_GROUP) {
            let ip = IpAddr::parse(addr);
            return Some(if ip.is_valid() { vec![ip] } else { Vec::new() });
        }
        [ID_GROUP, USER_GROUP]
            .iter()
            .find_map(|g| groups.get(*g))
            .map(|token| vec![IpAddr::raw(token.as_str())])
    }

    /// Check the ignore list and forward failures. Stops at the first
    /// ignored identity.
    async fn report(
        &self,
        identities: Vec<IpAddr>,
        time: f64,
        lines: Vec<String>,
        data: HashMap<String, String>,
    ) -> Vec<IpAddr> {
        let mut found = Vec::with_capacity(identities.len());
        for ip in identities {
            if self.in_ignore_ip_list(&ip, &data).await.is_some() {
                break;
            }
            info!("{} Found {} - {}", Jail(&self.jail), ip, format_time(time));
            self.fail_manager
                .add_failure(ip.clone(), time, lines.clone(), data.clone());
            metrics::record_failure(&self.jail);
            found.push(ip);
        }
        if !found.is_empty() {
            self.log_failures();
        }
        found
    }

    fn log_failures(&self) {
        let failures = self.fail_manager.failures();
        let list: Vec<String> = failures.iter().map(|(ip, n)| format!("{ip}:{n}")).collect();
        debug!(
            "{} Total # of detected failures: {}.",
            Jail(&self.jail),
            self.fail_manager.fail_total()
        );
        debug!(
            "{} Current failures from {} IPs (IP:count): {}",
            Jail(&self.jail),
            failures.len(),
            list.join(", ")
        );
    }

    /// Record a failure for `token` at the current time, bypassing the
    /// regexes.
    pub async fn add_attempt(
        &mut self,
        token: &str,
        captures: HashMap<String, String>,
    ) -> Vec<IpAddr> {
        let mut identities = self.dns.text_to_ip(token, self.use_dns).await;
        if identities.is_empty() {
            identities.push(IpAddr::raw(token.trim()));
        }
        for ip in &identities {
            info!("{} Attempt {}", Jail(&self.jail), ip);
        }
        let now = self.clock().now();
        let lines = captures.values().cloned().collect();
        self.report(identities, now, lines, captures).await
    }
}
