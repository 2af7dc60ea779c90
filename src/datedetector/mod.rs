//! Timestamp detection for log lines.
//!
//! A [`DateDetector`] holds an ordered list of [`DateTemplate`]s. The first
//! template that matches a line is locked and tried alone for following
//! lines; after [`UNLOCK_AFTER`] consecutive misses the whole list is
//! searched again.
//!
//! In operation mode the filter also passes every timestamp through
//! [`DateDetector::check_anomaly`], which reports clock offsets that look
//! like a misconfigured zone or a lagging source.

mod template;
pub mod timezone;

pub use template::{DEFAULT_PATTERNS, DateMatch, DateTemplate};

use crate::clock::Clock;
use crate::error::DateError;
use chrono::FixedOffset;
use tracing::{debug, warn};

/// Misses of the locked template before the full list is searched again.
pub const UNLOCK_AFTER: usize = 3;

/// Offsets within this many seconds of "now" are not reported.
pub const ANOMALY_TOLERANCE: f64 = 60.0;

/// Minimum clock time between two anomaly warnings.
pub const ANOMALY_WARN_INTERVAL: f64 = 60.0;

const ZONE_STEP: f64 = 900.0;

/// Kind of clock discrepancy between a log entry and now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAnomaly {
    Timezone,
    Latency,
}

impl TimeAnomaly {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timezone => "timezone",
            Self::Latency => "latency",
        }
    }
}

/// Classify `diff = now - entry_time`.
pub fn classify_offset(diff: f64) -> Option<TimeAnomaly> {
    if diff.abs() <= ANOMALY_TOLERANCE {
        return None;
    }
    if diff < 0.0 {
        return Some(TimeAnomaly::Timezone);
    }
    let rem = diff % ZONE_STEP;
    if diff >= ZONE_STEP - ANOMALY_TOLERANCE
        && (rem <= ANOMALY_TOLERANCE || rem >= ZONE_STEP - ANOMALY_TOLERANCE)
    {
        Some(TimeAnomaly::Timezone)
    } else {
        Some(TimeAnomaly::Latency)
    }
}

/// Render an offset the way the warning prints it: `1h`, `1h30m`, `61s`.
pub fn format_offset(secs: f64) -> String {
    let total = secs.abs().round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}

/// Ordered date templates with pattern locking.
#[derive(Debug)]
pub struct DateDetector {
    templates: Vec<DateTemplate>,
    default_patterns: bool,
    locked: Option<usize>,
    misses: usize,
    zone: Option<FixedOffset>,
    zone_text: Option<String>,
    clock: Clock,
    last_warning: Option<f64>,
}

impl DateDetector {
    /// Detector with the built-in table and the local zone.
    pub fn new(clock: Clock) -> Self {
        Self {
            templates: default_templates(),
            default_patterns: true,
            locked: None,
            misses: 0,
            zone: None,
            zone_text: None,
            clock,
            last_warning: None,
        }
    }

    /// Replace the template list. An empty slice restores the built-in table.
    pub fn set_patterns(&mut self, patterns: &[&str]) -> Result<(), DateError> {
        if patterns.is_empty() {
            self.templates = default_templates();
            self.default_patterns = true;
        } else {
            self.templates = patterns
                .iter()
                .map(|p| DateTemplate::new(p))
                .collect::<Result<Vec<_>, _>>()?;
            self.default_patterns = false;
        }
        self.locked = None;
        self.misses = 0;
        Ok(())
    }

    /// Configured patterns, or `None` when auto-detecting.
    pub fn patterns(&self) -> Option<Vec<String>> {
        if self.default_patterns {
            None
        } else {
            Some(self.templates.iter().map(|t| t.pattern().to_string()).collect())
        }
    }

    /// Zone applied to timestamps without an offset. `None` is local time.
    pub fn set_default_tz(&mut self, tz: Option<&str>) -> Result<(), DateError> {
        self.zone = match tz {
            Some(text) => timezone::parse_time_zone(text)?,
            None => None,
        };
        self.zone_text = tz.map(str::to_string).filter(|_| self.zone.is_some());
        Ok(())
    }

    pub fn default_tz(&self) -> Option<&str> {
        self.zone_text.as_deref()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Locate the timestamp of `line`.
    pub fn match_time(&mut self, line: &str) -> Option<DateMatch> {
        let now = self.clock.now();
        if let Some(idx) = self.locked {
            if let Some(m) = self.templates[idx].match_line(line, self.zone, now) {
                self.misses = 0;
                return Some(m);
            }
            self.misses += 1;
            if self.misses < UNLOCK_AFTER {
                return None;
            }
            debug!(
                pattern = self.templates[idx].pattern(),
                "Date pattern unlocked after repeated misses"
            );
            self.locked = None;
            self.misses = 0;
        }

        let (idx, m) = self
            .templates
            .iter()
            .enumerate()
            .find_map(|(i, t)| t.match_line(line, self.zone, now).map(|m| (i, m)))?;
        self.locked = Some(idx);
        Some(m)
    }

    /// Pattern currently locked, if any.
    pub fn locked_pattern(&self) -> Option<&str> {
        self.locked.map(|i| self.templates[i].pattern())
    }

    /// Report a suspicious offset between `time` and now, rate limited.
    ///
    /// Returns the classification when a warning was emitted.
    pub fn check_anomaly(&mut self, time: f64) -> Option<TimeAnomaly> {
        let now = self.clock.now();
        let diff = now - time;
        let kind = classify_offset(diff)?;
        if self
            .last_warning
            .is_some_and(|last| (now - last).abs() < ANOMALY_WARN_INTERVAL)
        {
            return None;
        }
        self.last_warning = Some(now);
        warn!(
            "Detected a log entry {} {} the current time in operation mode. \
             This looks like a {} problem. Please check a jail for a timing issue.",
            format_offset(diff),
            if diff >= 0.0 { "before" } else { "after" },
            kind.as_str()
        );
        Some(kind)
    }

    /// Let the next anomaly warn regardless of the rate limit.
    pub fn reset_anomaly_warning(&mut self) {
        self.last_warning = None;
    }
}

fn default_templates() -> Vec<DateTemplate> {
    DEFAULT_PATTERNS
        .iter()
        .filter_map(|p| DateTemplate::new(p).ok())
        .collect()
}
