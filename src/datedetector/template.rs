//! Date templates: strftime-like patterns compiled to named-group regexes.
//!
//! A pattern such as `{^LN-BEG}%ExY-%Exm-%Exd %ExH:%ExM:%ExS` is translated
//! once into a regex whose named groups carry the date fields. Matching a
//! line then assembles the captured fields with calendar arithmetic; the
//! process-wide local time settings are only consulted when no zone is
//! known for the line.

use super::timezone::parse_zone_token;
use crate::error::DateError;
use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, TimeZone};
use regex::{Captures, Regex};

/// Seconds a year-less timestamp may lie in the future before it is
/// attributed to the previous year.
const YEAR_ROLLBACK_SLACK: f64 = 86_400.0;

const RP_LINE_BEGIN: &str = r"^\W{0,2}";

const CGP_YEAR: &str = r"(?P<Y>\d{4})";
const CGP_YEAR_EXACT: &str = r"(?P<Y>(?:19|20)\d{2})";
const CGP_YEAR2: &str = r"(?P<y>\d{2})";
const CGP_MONTH: &str = r"(?P<m>1[0-2]|0?[1-9])";
const CGP_MONTH_EXACT: &str = r"(?P<m>1[0-2]|0[1-9])";
const CGP_MONTH_ABBR: &str = r"(?P<b>(?i:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec))";
const CGP_MONTH_NAME: &str = r"(?P<B>(?i:january|february|march|april|may|june|july|august|september|october|november|december))";
const CGP_DAY: &str = r"(?P<d>3[01]|[12]\d|0?[1-9])";
const CGP_DAY_EXACT: &str = r"(?P<d>3[01]|[12]\d|0[1-9])";
const CGP_DAY_SPACE: &str = r"(?P<d>3[01]|[12]\d|\s?[1-9])";
const CGP_HOUR: &str = r"(?P<H>2[0-3]|[01]?\d)";
const CGP_HOUR_EXACT: &str = r"(?P<H>2[0-3]|[01]\d)";
const CGP_MINUTE: &str = r"(?P<M>[0-5]?\d)";
const CGP_MINUTE_EXACT: &str = r"(?P<M>[0-5]\d)";
const CGP_SECOND: &str = r"(?P<S>6[01]|[0-5]?\d)";
const CGP_SECOND_EXACT: &str = r"(?P<S>6[01]|[0-5]\d)";
const CGP_FRACTION: &str = r"(?P<f>\d{1,9})";
const CGP_TZ_OFFSET: &str = r"(?P<z>Z|UTC|GMT|[+-]\d{2}(?::?\d{2})?)";
const CGP_TZ_NAME: &str = r"(?P<Z>[A-Za-z]{1,5})";
const RP_WEEKDAY_ABBR: &str = r"(?i:mon|tue|wed|thu|fri|sat|sun)";
const RP_WEEKDAY_NAME: &str = r"(?i:monday|tuesday|wednesday|thursday|friday|saturday|sunday)";
const CGP_EPOCH: &str = r"(?P<E>\d{10,11}(?:\.\d{1,9})?)\b";
const CGP_EPOCH_MILLIS: &str = r"(?P<LE>\d{13})\b";

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Built-in auto-detection table, most common formats first.
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"{^LN-BEG}%ExY[-/.]%Exm[-/.]%Exd(?:T|\s{1,2})%ExH:%ExM:%ExS(?:[.,]%f)?(?:\s*%z)?",
    r"{^LN-BEG}(?:%a )?%b %e %H:%M:%S(?:\.%f)?(?: %ExY)?",
    r"{^LN-BEG}(?:%a )?%b %e %ExY %H:%M:%S(?:\.%f)?",
    r"%d/%b/%ExY:%H:%M:%S(?:\.%f)?(?: %z)?",
    r"{^LN-BEG}%Exd[-/.]%Exm[-/.]%ExY[ :]%ExH:%ExM:%ExS(?:\.%f)?",
    r"{^LN-BEG}%Exy%Exm%Exd\s{1,2}%H:%M:%S",
    r"{^LN-BEG}EPOCH",
    r"{^LN-BEG}LEPOCH",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateKind {
    Fields,
    Epoch,
    EpochMillis,
}

/// A located timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateMatch {
    /// Unix seconds.
    pub time: f64,
    /// Byte range of the timestamp text in the line.
    pub start: usize,
    pub end: usize,
}

/// One compiled date pattern.
#[derive(Debug, Clone)]
pub struct DateTemplate {
    pattern: String,
    regex: Regex,
    kind: TemplateKind,
}

impl DateTemplate {
    /// Compile a pattern. Unknown `%` directives and repeated fields are errors.
    pub fn new(pattern: &str) -> Result<Self, DateError> {
        let invalid = |reason: String| DateError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let mut body = pattern.trim();
        let mut anchored = false;
        if let Some(rest) = body.strip_prefix("{^LN-BEG}") {
            body = rest;
            anchored = true;
        } else if let Some(rest) = body.strip_prefix("{UNANCHORED}") {
            body = rest;
        } else if let Some(rest) = body.strip_prefix('^') {
            body = rest;
            anchored = true;
        }
        body = body.strip_suffix("**").unwrap_or(body).trim_end();
        if body.is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }

        let (expr, kind) = match body {
            "EPOCH" => (CGP_EPOCH.to_string(), TemplateKind::Epoch),
            "LEPOCH" => (CGP_EPOCH_MILLIS.to_string(), TemplateKind::EpochMillis),
            _ => (translate(body).map_err(invalid)?, TemplateKind::Fields),
        };
        let full = if anchored {
            format!("{RP_LINE_BEGIN}(?:{expr})")
        } else {
            format!("(?:{expr})")
        };
        let regex = Regex::new(&full).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            kind,
        })
    }

    /// The pattern as configured.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Locate and convert a timestamp in `line`.
    ///
    /// `zone` applies when the line carries no offset of its own (`None`
    /// means local time); `now` resolves a missing year or date.
    pub fn match_line(&self, line: &str, zone: Option<FixedOffset>, now: f64) -> Option<DateMatch> {
        let caps = self.regex.captures(line)?;
        let whole = caps.get(0)?;
        let time = match self.kind {
            TemplateKind::Epoch => caps.name("E")?.as_str().parse::<f64>().ok()?,
            TemplateKind::EpochMillis => caps.name("LE")?.as_str().parse::<f64>().ok()? / 1000.0,
            TemplateKind::Fields => assemble(&caps, zone, now)?,
        };
        Some(DateMatch {
            time,
            start: whole.start(),
            end: whole.end(),
        })
    }
}

/// Translate `%` directives into regex groups; everything else is kept as
/// regex text.
fn translate(body: &str) -> Result<String, String> {
    let mut out = String::with_capacity(body.len() * 4);
    let mut seen: Vec<char> = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let exact = chars.peek() == Some(&'E') && {
            let mut ahead = chars.clone();
            ahead.next();
            ahead.next() == Some('x')
        };
        if exact {
            chars.next();
            chars.next();
        }
        let directive = chars
            .next()
            .ok_or_else(|| "dangling '%' at end of pattern".to_string())?;

        let group = match (directive, exact) {
            ('%', false) => {
                out.push('%');
                continue;
            }
            ('Y', false) => CGP_YEAR,
            ('Y', true) => CGP_YEAR_EXACT,
            ('y', _) => CGP_YEAR2,
            ('m', false) => CGP_MONTH,
            ('m', true) => CGP_MONTH_EXACT,
            ('b', _) => CGP_MONTH_ABBR,
            ('B', _) => CGP_MONTH_NAME,
            ('d', false) => CGP_DAY,
            ('d', true) => CGP_DAY_EXACT,
            ('e', _) => CGP_DAY_SPACE,
            ('H', false) => CGP_HOUR,
            ('H', true) => CGP_HOUR_EXACT,
            ('M', false) => CGP_MINUTE,
            ('M', true) => CGP_MINUTE_EXACT,
            ('S', false) => CGP_SECOND,
            ('S', true) => CGP_SECOND_EXACT,
            ('f', _) => CGP_FRACTION,
            ('z', _) => CGP_TZ_OFFSET,
            ('Z', _) => CGP_TZ_NAME,
            ('a', _) => {
                out.push_str(RP_WEEKDAY_ABBR);
                continue;
            }
            ('A', _) => {
                out.push_str(RP_WEEKDAY_NAME);
                continue;
            }
            (other, true) => return Err(format!("unknown directive %Ex{other}")),
            (other, false) => return Err(format!("unknown directive %{other}")),
        };
        // %d and %e share a group
        let field = if directive == 'e' { 'd' } else { directive };
        if seen.contains(&field) {
            return Err(format!("field %{directive} used twice"));
        }
        seen.push(field);
        out.push_str(group);
    }
    Ok(out)
}

fn month_from_name(name: &str) -> Option<u32> {
    let prefix = name.get(..3)?.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|i| i as u32 + 1)
}

fn to_timestamp(date: NaiveDate, h: u32, m: u32, s: u32, zone: Option<FixedOffset>) -> Option<i64> {
    let naive = date.and_hms_opt(h, m, s)?;
    match zone {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp()),
        None => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp()),
    }
}

fn today(now: f64, zone: Option<FixedOffset>) -> Option<NaiveDate> {
    let utc = DateTime::from_timestamp(now.floor() as i64, 0)?;
    Some(match zone {
        Some(offset) => utc.with_timezone(&offset).date_naive(),
        None => utc.with_timezone(&Local).date_naive(),
    })
}

/// Build a timestamp from the captured date fields.
fn assemble(caps: &Captures<'_>, zone: Option<FixedOffset>, now: f64) -> Option<f64> {
    let num = |name: &str| caps.name(name).and_then(|m| m.as_str().trim().parse::<u32>().ok());

    let zone = caps
        .name("z")
        .or_else(|| caps.name("Z"))
        .and_then(|m| parse_zone_token(m.as_str()))
        .or(zone);
    let today = today(now, zone)?;

    let year = match (caps.name("Y"), num("y")) {
        (Some(y), _) => Some(y.as_str().parse::<i32>().ok()?),
        (None, Some(yy)) => Some(2000 + yy as i32),
        (None, None) => None,
    };
    let month = num("m")
        .or_else(|| caps.name("b").and_then(|m| month_from_name(m.as_str())))
        .or_else(|| caps.name("B").and_then(|m| month_from_name(m.as_str())));
    let day = num("d");
    let hour = num("H").unwrap_or(0);
    let minute = num("M").unwrap_or(0);
    // leap seconds are folded into the last regular second
    let second = num("S").unwrap_or(0).min(59);
    let fraction = caps
        .name("f")
        .and_then(|m| format!("0.{}", m.as_str()).parse::<f64>().ok())
        .unwrap_or(0.0);

    let (month, day) = match (month, day) {
        (Some(m), Some(d)) => (m, d),
        (None, None) => (today.month(), today.day()),
        (Some(m), None) => (m, 1),
        (None, Some(d)) => (today.month(), d),
    };

    let resolve = |y: i32| {
        NaiveDate::from_ymd_opt(y, month, day)
            .and_then(|date| to_timestamp(date, hour, minute, second, zone))
    };
    let secs = match year {
        Some(y) => resolve(y)?,
        None => {
            let current = resolve(today.year());
            match current {
                Some(t) if (t as f64) <= now + YEAR_ROLLBACK_SLACK => t,
                _ => resolve(today.year() - 1)?,
            }
        }
    };
    Some(secs as f64 + fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_124_013_600.0; // 2005-08-14 10:00:00 UTC

    fn utc() -> Option<FixedOffset> {
        FixedOffset::east_opt(0)
    }

    fn plus2() -> Option<FixedOffset> {
        FixedOffset::east_opt(7200)
    }

    #[test]
    fn test_syslog_without_year() {
        let t = DateTemplate::new(DEFAULT_PATTERNS[1]).unwrap();
        let line = "Aug 14 11:59:59 [sshd] error: PAM: Authentication failure";
        let m = t.match_line(line, plus2(), NOW).unwrap();
        assert_eq!(m.time, 1_124_013_599.0);
        assert_eq!(&line[m.start..m.end], "Aug 14 11:59:59");
    }

    #[test]
    fn test_year_rollback() {
        let t = DateTemplate::new(DEFAULT_PATTERNS[1]).unwrap();
        // December entry seen in August belongs to the previous year
        let m = t.match_line("Dec 31 23:59:59 x", utc(), NOW).unwrap();
        assert_eq!(m.time, 1_104_537_599.0); // 2004-12-31 23:59:59 UTC
    }

    #[test]
    fn test_single_digit_day() {
        let t = DateTemplate::new(DEFAULT_PATTERNS[1]).unwrap();
        let m = t.match_line("Aug  4 00:00:00 host", utc(), NOW).unwrap();
        assert_eq!(m.time, 1_123_113_600.0);
    }

    #[test]
    fn test_iso_with_offset() {
        let t = DateTemplate::new(DEFAULT_PATTERNS[0]).unwrap();
        let m = t
            .match_line("2005-08-14T11:59:59.5+02:00 fail", utc(), NOW)
            .unwrap();
        assert_eq!(m.time, 1_124_013_599.5);
        let m = t.match_line("2005-08-14 09:59:59 fail", utc(), NOW).unwrap();
        assert_eq!(m.time, 1_124_013_599.0);
    }

    #[test]
    fn test_explicit_pattern_with_zone_name() {
        let t = DateTemplate::new(r"{^LN-BEG}%Y-%m-%d %H:%M:%S(?:\s*%Z)?\s").unwrap();
        let m = t.match_line("2019-10-27 04:00:00 GMT fail", plus2(), NOW).unwrap();
        assert_eq!(m.time, 1_572_148_800.0);
        let m = t.match_line("2019-10-27 04:00:00 fail", plus2(), NOW).unwrap();
        assert_eq!(m.time, 1_572_148_800.0 - 7200.0);
        let m = t.match_line("2019-10-27 05:00:00 CET fail", utc(), NOW).unwrap();
        assert_eq!(m.time, 1_572_148_800.0);
    }

    #[test]
    fn test_epoch() {
        let t = DateTemplate::new("{^LN-BEG}EPOCH").unwrap();
        let line = "1387203300.222 192.168.1.32";
        let m = t.match_line(line, None, NOW).unwrap();
        assert!((m.time - 1_387_203_300.222).abs() < 1e-6);
        assert_eq!(&line[m.end..], " 192.168.1.32");
        assert!(t.match_line("1387203300222 x", None, NOW).is_none());
        let t = DateTemplate::new("LEPOCH").unwrap();
        let m = t.match_line("1387203300222 x", None, NOW).unwrap();
        assert!((m.time - 1_387_203_300.222).abs() < 1e-6);
    }

    #[test]
    fn test_exact_directives() {
        let t = DateTemplate::new("^%ExY-%Exm-%Exd %ExH:%ExM:%ExS").unwrap();
        assert!(t.match_line("2005-08-14 10:00:00", utc(), NOW).is_some());
        assert!(t.match_line("2005-8-14 10:00:00", utc(), NOW).is_none());
        assert!(t.match_line("x 2005-08-14 10:00:00", utc(), NOW).is_none());
    }

    #[test]
    fn test_anchor_allows_leading_punctuation() {
        let t = DateTemplate::new("^%Y-%m-%d %H:%M:%S").unwrap();
        assert!(t.match_line("[2005-08-14 10:00:00] x", utc(), NOW).is_some());
        assert!(t.match_line("abc 2005-08-14 10:00:00", utc(), NOW).is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(DateTemplate::new("%Y-%Q").is_err());
        assert!(DateTemplate::new("%Y %Y").is_err());
        assert!(DateTemplate::new("%Y-%m-%d (").is_err());
        assert!(DateTemplate::new("").is_err());
        assert!(DateTemplate::new("%H:%M %").is_err());
    }

    #[test]
    fn test_time_only_uses_today() {
        let t = DateTemplate::new("^%H:%M:%S").unwrap();
        let m = t.match_line("09:00:00 x", utc(), NOW).unwrap();
        assert_eq!(m.time, NOW - 3600.0);
    }

    #[test]
    fn test_default_patterns_compile() {
        for p in DEFAULT_PATTERNS {
            assert!(DateTemplate::new(p).is_ok(), "{p}");
        }
    }
}
